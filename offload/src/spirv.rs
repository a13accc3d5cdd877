//! Structural reader for SPIR-V binaries.
//!
//! Only what program loading needs: header checks, a walk over the
//! instruction stream, and the names declared by `OpEntryPoint`. A blob that
//! is not SPIR-V at all is an [`Error::InvalidBinary`]; a SPIR-V module that
//! cannot be built (unsupported version, broken instruction stream) is an
//! [`Error::BuildFailed`].

use crate::{Error, Result};

pub const MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;
const OP_ENTRY_POINT: u32 = 15;
const MAX_MINOR_VERSION: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Execution model operand (5 = GLCompute, 6 = Kernel).
    pub execution_model: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub version: (u8, u8),
    pub generator: u32,
    pub bound: u32,
    pub entry_points: Vec<EntryPoint>,
    words: Vec<u32>,
}

impl Module {
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Module words in host order, for handing to APIs that take `&[u32]`.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn entry_point_names(&self) -> Vec<String> {
        self.entry_points.iter().map(|e| e.name.clone()).collect()
    }
}

pub fn parse(bytes: &[u8]) -> Result<Module> {
    if bytes.len() < HEADER_WORDS * 4 {
        return Err(Error::InvalidBinary(format!(
            "{} bytes is shorter than the SPIR-V header",
            bytes.len()
        )));
    }
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidBinary(format!(
            "length {} is not a multiple of the word size",
            bytes.len()
        )));
    }

    let first = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let swapped = if first == MAGIC {
        false
    } else if first.swap_bytes() == MAGIC {
        true
    } else {
        return Err(Error::InvalidBinary(format!("bad magic number {first:#010x}")));
    };

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| {
            let w = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            if swapped {
                w.swap_bytes()
            } else {
                w
            }
        })
        .collect();

    let major = ((words[1] >> 16) & 0xff) as u8;
    let minor = ((words[1] >> 8) & 0xff) as u8;
    if major != 1 || minor > MAX_MINOR_VERSION {
        return Err(Error::BuildFailed(format!(
            "unsupported SPIR-V version {major}.{minor}"
        )));
    }

    let entry_points = walk(&words)?;

    Ok(Module {
        version: (major, minor),
        generator: words[2],
        bound: words[3],
        entry_points,
        words,
    })
}

fn walk(words: &[u32]) -> Result<Vec<EntryPoint>> {
    let mut entry_points = Vec::new();
    let mut at = HEADER_WORDS;
    while at < words.len() {
        let count = (words[at] >> 16) as usize;
        let opcode = words[at] & 0xffff;
        if count == 0 {
            return Err(Error::BuildFailed(format!(
                "zero-length instruction at word {at}"
            )));
        }
        if at + count > words.len() {
            return Err(Error::BuildFailed(format!(
                "instruction at word {at} runs past the end of the module"
            )));
        }
        if opcode == OP_ENTRY_POINT {
            let operands = &words[at + 1..at + count];
            if operands.len() < 3 {
                return Err(Error::BuildFailed(format!(
                    "truncated OpEntryPoint at word {at}"
                )));
            }
            entry_points.push(EntryPoint {
                execution_model: operands[0],
                name: literal_string(&operands[2..]),
            });
        }
        at += count;
    }
    Ok(entry_points)
}

// Literal strings are nul-terminated UTF-8 packed little-endian into words.
fn literal_string(words: &[u32]) -> String {
    let mut bytes = Vec::new();
    'outer: for w in words {
        for b in w.to_le_bytes() {
            if b == 0 {
                break 'outer;
            }
            bytes.push(b);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal module: header plus one OpEntryPoint per name.
    pub(crate) fn module_bytes(version: (u8, u8), names: &[&str]) -> Vec<u8> {
        let mut words = vec![
            MAGIC,
            ((version.0 as u32) << 16) | ((version.1 as u32) << 8),
            0,
            16,
            0,
        ];
        for (i, name) in names.iter().enumerate() {
            let mut packed: Vec<u8> = name.bytes().collect();
            packed.push(0);
            while packed.len() % 4 != 0 {
                packed.push(0);
            }
            let name_words: Vec<u32> = packed
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let count = 3 + name_words.len() as u32;
            words.push((count << 16) | OP_ENTRY_POINT);
            words.push(6);
            words.push(i as u32 + 1);
            words.extend(name_words);
        }
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_reads_entry_point_names() {
        let module = parse(&module_bytes((1, 2), &["vector_add", "scale"])).unwrap();
        assert_eq!(module.version, (1, 2));
        assert_eq!(module.entry_point_names(), vec!["vector_add", "scale"]);
        assert_eq!(module.entry_points[0].execution_model, 6);
    }

    #[test]
    fn test_accepts_byte_swapped_module() {
        let bytes = module_bytes((1, 0), &["k"]);
        let swapped: Vec<u8> = bytes
            .chunks_exact(4)
            .flat_map(|c| [c[3], c[2], c[1], c[0]])
            .collect();
        assert_eq!(parse(&swapped).unwrap().entry_point_names(), vec!["k"]);
    }

    #[test]
    fn test_garbage_is_invalid_binary() {
        assert!(matches!(parse(b"not spirv at all!!!!"), Err(Error::InvalidBinary(_))));
        assert!(matches!(parse(&[0x03, 0x02, 0x23, 0x07]), Err(Error::InvalidBinary(_))));
        let mut odd = module_bytes((1, 0), &[]);
        odd.push(0);
        assert!(matches!(parse(&odd), Err(Error::InvalidBinary(_))));
    }

    #[test]
    fn test_valid_header_with_bad_stream_fails_build() {
        assert!(matches!(parse(&module_bytes((2, 0), &["k"])), Err(Error::BuildFailed(_))));

        let mut bytes = module_bytes((1, 3), &[]);
        bytes.extend((9u32 << 16 | 1).to_le_bytes());
        assert!(matches!(parse(&bytes), Err(Error::BuildFailed(_))));

        let mut bytes = module_bytes((1, 3), &[]);
        bytes.extend(0u32.to_le_bytes());
        assert!(matches!(parse(&bytes), Err(Error::BuildFailed(_))));
    }
}
