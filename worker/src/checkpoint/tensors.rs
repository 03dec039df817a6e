use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::state::{NamedTensor, TensorSet};

/// Serialises `set` as a safetensors blob of `f32` tensors.
pub fn encode(set: &TensorSet) -> Result<Vec<u8>, String> {
    let views = set
        .tensors()
        .iter()
        .map(|t| {
            TensorView::new(
                Dtype::F32,
                t.shape.clone(),
                bytemuck::cast_slice(t.values.as_slice()),
            )
            .map(|view| (t.name.as_str(), view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("tensor shape doesn't match its values: {e}"))?;

    safetensors::serialize(views, &None).map_err(|e| e.to_string())
}

/// Parses a blob written by `encode`.
pub fn decode(bytes: &[u8]) -> Result<TensorSet, String> {
    let blob = SafeTensors::deserialize(bytes).map_err(|e| e.to_string())?;

    let mut tensors = Vec::new();
    for (name, view) in blob.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(format!("tensor {name} is {:?}, expected F32", view.dtype()));
        }

        tensors.push(NamedTensor {
            shape: view.shape().to_vec(),
            values: bytemuck::pod_collect_to_vec(view.data()),
            name,
        });
    }

    Ok(TensorSet::new(tensors))
}
