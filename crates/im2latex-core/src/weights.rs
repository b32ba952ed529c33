use std::fs::File;
use std::path::Path;

use memmap2::MmapOptions;
use safetensors::{Dtype, SafeTensors};
use tch::{nn, Kind, Tensor};

use crate::error::{ModelError, Result};

fn kind_of(dtype: Dtype) -> Option<Kind> {
    match dtype {
        Dtype::F32 => Some(Kind::Float),
        Dtype::F64 => Some(Kind::Double),
        Dtype::F16 => Some(Kind::Half),
        Dtype::BF16 => Some(Kind::BFloat16),
        Dtype::I64 => Some(Kind::Int64),
        _ => None,
    }
}

/// Loads a safetensors file into `vs`, requiring an exact match of tensor
/// names and shapes. Nothing is copied unless every tensor matches.
pub fn load_weights<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<usize> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let variables = vs.variables();
    let device = vs.device();

    for name in tensors.names() {
        if !variables.contains_key(name.as_str()) {
            return Err(ModelError::UnexpectedTensor(name.clone()));
        }
    }

    let mut staged = Vec::with_capacity(variables.len());
    for (name, var) in &variables {
        let view = tensors
            .tensor(name)
            .map_err(|_| ModelError::MissingTensor(name.clone()))?;
        let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
        if shape != var.size() {
            return Err(ModelError::ShapeMismatch {
                name: name.clone(),
                expected: var.size(),
                found: shape,
            });
        }
        let kind = kind_of(view.dtype()).ok_or_else(|| ModelError::UnsupportedDtype {
            name: name.clone(),
            dtype: view.dtype(),
        })?;
        let data = Tensor::from_data_size(view.data(), &shape, kind);
        staged.push((var.shallow_clone(), data));
    }

    tch::no_grad(|| {
        for (mut var, data) in staged {
            let data = data.to_device(device).to_kind(var.kind());
            var.copy_(&data);
        }
    });

    log::debug!(
        "loaded {} tensors from {}",
        variables.len(),
        path.as_ref().display()
    );
    Ok(variables.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn store_with(shape: &[i64]) -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().var("w", shape, nn::Init::Randn { mean: 0.0, stdev: 1.0 });
        vs
    }

    #[test]
    fn restores_saved_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let source = store_with(&[2, 3]);
        source.save(&path).unwrap();

        let mut target = store_with(&[2, 3]);
        assert_eq!(load_weights(&mut target, &path).unwrap(), 1);

        let a = source.variables()["w"].shallow_clone();
        let b = target.variables()["w"].shallow_clone();
        assert!(a.allclose(&b, 1e-6, 1e-6, false));
    }

    #[test]
    fn rejects_shape_mismatch_without_partial_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        store_with(&[2, 3]).save(&path).unwrap();

        let mut target = store_with(&[3, 2]);
        let before = target.variables()["w"].copy();
        let err = load_weights(&mut target, &path).unwrap_err();
        assert!(err.is_mismatch());
        assert!(before.equal(&target.variables()["w"]));
    }

    #[test]
    fn rejects_unknown_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let source = store_with(&[2]);
        let _ = source.root().var("extra", &[1], nn::Init::Const(0.0));
        source.save(&path).unwrap();

        let mut target = store_with(&[2]);
        assert!(matches!(
            load_weights(&mut target, &path),
            Err(ModelError::UnexpectedTensor(name)) if name == "extra"
        ));
    }
}
