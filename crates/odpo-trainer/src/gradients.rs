//! Gradient accumulation and cross-worker averaging.

use std::rc::Rc;

use mlx_rs::error::Exception;
use mlx_rs::module::FlattenedModuleParam;
use mlx_rs::{Array, Dtype};
use odpo_distributed::Collective;

use crate::error::OnlineDpoResult;

/// Add `new_grads * weight` into `accumulated`.
///
/// The first call takes ownership of the scaled gradients. Later calls add
/// them key by key.
pub fn accumulate_gradients(
    accumulated: Option<FlattenedModuleParam>,
    new_grads: FlattenedModuleParam,
    weight: f32,
) -> Result<FlattenedModuleParam, Exception> {
    let scale = Array::from_f32(weight);
    match accumulated {
        None => {
            let mut scaled = FlattenedModuleParam::new();
            for (key, grad) in new_grads {
                scaled.insert(key, grad.multiply(&scale)?);
            }
            Ok(scaled)
        }
        Some(mut acc) => {
            for (key, grad) in new_grads {
                let scaled = grad.multiply(&scale)?;
                match acc.get_mut(&key) {
                    Some(existing) => *existing = existing.add(&scaled)?,
                    None => {
                        acc.insert(key, scaled);
                    }
                }
            }
            Ok(acc)
        }
    }
}

/// Average `grads` over all workers.
///
/// Keys are visited in sorted order so every worker packs the flat buffer the
/// same way.
pub fn all_reduce_gradients<C: Collective + ?Sized>(
    grads: FlattenedModuleParam,
    collective: &C,
) -> OnlineDpoResult<FlattenedModuleParam> {
    if collective.world_size() == 1 {
        return Ok(grads);
    }

    let mut keys: Vec<Rc<str>> = grads.keys().cloned().collect();
    keys.sort();

    let mut flat = Vec::new();
    let mut shapes = Vec::with_capacity(keys.len());
    for key in &keys {
        let grad = grads[key].as_dtype(Dtype::Float32)?;
        grad.eval()?;
        flat.extend_from_slice(grad.as_slice::<f32>());
        shapes.push(grad.shape().to_vec());
    }

    collective.all_reduce_mean(&mut flat)?;

    let mut reduced = FlattenedModuleParam::new();
    let mut offset = 0;
    for (key, shape) in keys.into_iter().zip(shapes) {
        let len: usize = shape.iter().map(|&d| d as usize).product();
        reduced.insert(key, Array::from_slice(&flat[offset..offset + len], &shape));
        offset += len;
    }
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn grads(values: &[(&str, &[f32])]) -> FlattenedModuleParam {
        values
            .iter()
            .map(|(k, v)| (Rc::from(*k), Array::from_slice(v, &[v.len() as i32])))
            .collect()
    }

    fn host(params: &FlattenedModuleParam, key: &str) -> Vec<f32> {
        let a = &params[key];
        a.eval().unwrap();
        a.as_slice::<f32>().to_vec()
    }

    #[test]
    fn test_weighted_accumulation() {
        let first = grads(&[("w", &[2.0, 4.0]), ("b", &[1.0])]);
        let second = grads(&[("w", &[4.0, 0.0]), ("b", &[3.0])]);
        let acc = accumulate_gradients(None, first, 0.25).unwrap();
        let acc = accumulate_gradients(Some(acc), second, 0.75).unwrap();
        assert_eq!(host(&acc, "w"), vec![3.5, 1.0]);
        assert_eq!(host(&acc, "b"), vec![2.5]);
    }

    /// Pretends a second worker holds gradients of all ones.
    struct TwoWorkers;

    impl Collective for TwoWorkers {
        fn rank(&self) -> usize {
            0
        }
        fn world_size(&self) -> usize {
            2
        }
        fn broadcast_u64(&self, value: u64, _root: usize) -> Result<u64> {
            Ok(value)
        }
        fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<()> {
            for v in buffer.iter_mut() {
                *v += 1.0;
            }
            Ok(())
        }
    }

    #[test]
    fn test_all_reduce_averages_and_preserves_shapes() {
        let mut g = FlattenedModuleParam::new();
        g.insert(Rc::from("a"), Array::from_slice(&[3.0f32, 5.0, 7.0, 9.0], &[2, 2]));
        g.insert(Rc::from("b"), Array::from_slice(&[1.0f32], &[1]));
        let reduced = all_reduce_gradients(g, &TwoWorkers).unwrap();
        assert_eq!(reduced["a"].shape(), &[2, 2]);
        assert_eq!(host(&reduced, "a"), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(host(&reduced, "b"), vec![1.0]);
    }
}
