use std::collections::HashSet;

use offload_types::{ArgSpec, KernelDescriptor};
use crate::Error;

/// Reject descriptors the harness cannot run, before any device work.
pub fn validate(desc: &KernelDescriptor) -> Result<(), Error> {
    if desc.kernels.is_empty() {
        return Err(Error::InvalidConfig(format!("`{}` declares no kernels", desc.name)));
    }
    if desc.program.is_empty() {
        return Err(Error::InvalidConfig(format!("`{}` declares no program source", desc.name)));
    }

    for source in &desc.program {
        if source.mode != source.dialect.load_mode() {
            return Err(Error::InvalidConfig(format!(
                "{} is {:?} but declared as {:?}",
                source.path.display(),
                source.dialect,
                source.mode
            )));
        }
    }

    // Names must be unique across buffers and scalars
    let mut names = HashSet::new();
    for name in desc
        .buffers
        .iter()
        .map(|b| &b.name)
        .chain(desc.scalars.iter().map(|s| &s.name))
    {
        if !names.insert(name.as_str()) {
            return Err(Error::InvalidConfig(format!("duplicate name `{name}`")));
        }
    }

    for buffer in &desc.buffers {
        if buffer.len == 0 {
            return Err(Error::InvalidConfig(format!("buffer `{}` has zero length", buffer.name)));
        }
        if let Some(tolerance) = buffer.tolerance {
            if !buffer.element.is_float() {
                return Err(Error::InvalidConfig(format!(
                    "buffer `{}` holds {:?}; tolerances apply to float buffers only",
                    buffer.name, buffer.element
                )));
            }
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "buffer `{}` has tolerance {tolerance}",
                    buffer.name
                )));
            }
        }
    }

    for kernel in &desc.kernels {
        for (slot, arg) in kernel.args.iter().enumerate() {
            match arg {
                ArgSpec::Buffer { name } if desc.buffer(name).is_none() => {
                    return Err(Error::InvalidConfig(format!(
                        "kernel `{}` slot {slot} names unknown buffer `{name}`",
                        kernel.name
                    )));
                }
                ArgSpec::Scalar { name } if desc.scalar(name).is_none() => {
                    return Err(Error::InvalidConfig(format!(
                        "kernel `{}` slot {slot} names unknown scalar `{name}`",
                        kernel.name
                    )));
                }
                ArgSpec::Local { bytes: 0 } => {
                    return Err(Error::InvalidConfig(format!(
                        "kernel `{}` slot {slot} declares empty local scratch",
                        kernel.name
                    )));
                }
                _ => {}
            }
        }

        let work = &kernel.work;
        if work.global.is_empty() || work.global.len() > 3 {
            return Err(Error::InvalidConfig(format!(
                "kernel `{}` has a {}-dimensional work shape",
                kernel.name,
                work.global.len()
            )));
        }
        if work.global.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "kernel `{}` has an empty global work dimension",
                kernel.name
            )));
        }
        if let Some(local) = &work.local {
            if local.len() != work.global.len() {
                return Err(Error::InvalidConfig(format!(
                    "kernel `{}` local shape has {} dimension(s), global has {}",
                    kernel.name,
                    local.len(),
                    work.global.len()
                )));
            }
            for (&g, &l) in work.global.iter().zip(local) {
                if l == 0 || g % l != 0 {
                    return Err(Error::InvalidConfig(format!(
                        "kernel `{}` local size {l} does not divide global size {g}",
                        kernel.name
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_types::*;
    use std::path::PathBuf;

    fn descriptor() -> KernelDescriptor {
        KernelDescriptor {
            name: "scale".into(),
            device: DeviceSelector::default(),
            program: vec![ProgramSource {
                dialect: Dialect::Wgsl,
                mode: LoadMode::Source,
                path: PathBuf::from("scale.wgsl"),
                build_options: String::new(),
            }],
            kernels: vec![KernelSpec {
                name: "scale".into(),
                args: vec![
                    ArgSpec::Buffer { name: "data".into() },
                    ArgSpec::Scalar { name: "factor".into() },
                ],
                work: WorkShape::linear(64, Some(16)),
            }],
            buffers: vec![BufferSpec {
                name: "data".into(),
                element: ElementType::F32,
                len: 64,
                access: AccessMode::ReadWrite,
                reference: true,
                tolerance: Some(1e-6),
            }],
            scalars: vec![ScalarSpec {
                name: "factor".into(),
                value: ScalarValue::F32(2.0),
            }],
            mode: ExecutionMode::SingleShot,
        }
    }

    fn rejected(desc: &KernelDescriptor) -> bool {
        matches!(validate(desc), Err(Error::InvalidConfig(_)))
    }

    #[test]
    fn test_valid_descriptor_passes() {
        assert!(validate(&descriptor()).is_ok());
    }

    #[test]
    fn test_structural_errors() {
        let mut d = descriptor();
        d.kernels.clear();
        assert!(rejected(&d));

        let mut d = descriptor();
        d.scalars[0].name = "data".into();
        assert!(rejected(&d));

        let mut d = descriptor();
        d.kernels[0].args.push(ArgSpec::Buffer { name: "nope".into() });
        assert!(rejected(&d));

        let mut d = descriptor();
        d.kernels[0].args.push(ArgSpec::Local { bytes: 0 });
        assert!(rejected(&d));

        let mut d = descriptor();
        d.program[0].mode = LoadMode::Binary;
        assert!(rejected(&d));

        let mut d = descriptor();
        d.buffers[0].len = 0;
        assert!(rejected(&d));
    }

    #[test]
    fn test_work_shape_errors() {
        let mut d = descriptor();
        d.kernels[0].work = WorkShape::linear(64, Some(24));
        assert!(rejected(&d));

        let mut d = descriptor();
        d.kernels[0].work.global = vec![4, 4, 4, 4];
        d.kernels[0].work.local = None;
        assert!(rejected(&d));

        let mut d = descriptor();
        d.kernels[0].work.global = vec![64, 0];
        d.kernels[0].work.local = None;
        assert!(rejected(&d));
    }

    #[test]
    fn test_tolerance_rules() {
        let mut d = descriptor();
        d.buffers[0].tolerance = Some(-1.0);
        assert!(rejected(&d));

        let mut d = descriptor();
        d.buffers[0].tolerance = Some(f64::NAN);
        assert!(rejected(&d));

        let mut d = descriptor();
        d.buffers[0].element = ElementType::U32;
        assert!(rejected(&d));
    }
}
