//! Element-wise vector addition, run once.

use offload::{BufferSet, Error, Hooks, HostLaunch, KernelDescriptor, KernelRegistry, ScalarSet, ScalarValue, WorkShape};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DESCRIPTOR_BINARY: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/vecadd.bin"));

const WORKGROUP: usize = 64;
const DEFAULT_SEED: u64 = 0x5eed_add;

/// The descriptor compiled from `descriptor.json`.
pub fn descriptor() -> offload::Result<KernelDescriptor> {
    bincode::deserialize(DESCRIPTOR_BINARY)
        .map_err(|e| Error::InvalidConfig(format!("embedded vecadd descriptor: {e}")))
}

/// The same program over vectors of `len` elements.
pub fn descriptor_with_len(len: usize) -> offload::Result<KernelDescriptor> {
    let mut desc = descriptor()?;
    for buffer in &mut desc.buffers {
        buffer.len = len;
    }
    for scalar in &mut desc.scalars {
        if scalar.name == "n" {
            scalar.value = ScalarValue::U32(len as u32);
        }
    }
    let global = len.div_ceil(WORKGROUP) * WORKGROUP;
    for kernel in &mut desc.kernels {
        kernel.work = WorkShape::linear(global, Some(WORKGROUP));
    }
    Ok(desc)
}

fn vecadd_kernel(launch: &HostLaunch<'_>) -> offload::Result<()> {
    let a = launch.buffer::<f32>(0)?;
    let b = launch.buffer::<f32>(1)?;
    let mut c = launch.buffer::<f32>(2)?;
    let n = launch.u32(3)? as usize;
    for i in 0..launch.invocations().min(n) {
        c[i] = a[i] + b[i];
    }
    Ok(())
}

/// Host implementation of every kernel in the program.
pub fn host_kernels() -> KernelRegistry {
    KernelRegistry::new().with("vecadd", vecadd_kernel)
}

pub fn reference(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Fills `a` and `b` with seeded values in `[-1, 1)` and the expected `c`.
pub struct VecAddHooks {
    rng: StdRng,
}

impl VecAddHooks {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for VecAddHooks {
    fn default() -> Self {
        Self::seeded(DEFAULT_SEED)
    }
}

impl Hooks for VecAddHooks {
    fn setup(&mut self, buffers: &mut BufferSet, _scalars: &mut ScalarSet) -> offload::Result<()> {
        for name in ["a", "b"] {
            for x in buffers.f32_mut(name)? {
                *x = self.rng.gen_range(-1.0..1.0);
            }
        }
        let expected = reference(buffers.f32("a")?, buffers.f32("b")?);
        buffers.reference_mut::<f32>("c")?.copy_from_slice(&expected);
        Ok(())
    }
}
