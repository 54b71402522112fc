//! In-memory parameter store with per-block locking
//!
//! Two lock levels: a short-lived map lock for name lookup, and one RwLock
//! per block bounding the critical section of an update. Different blocks
//! update fully in parallel; updates to the same block serialize in lock
//! grant order.

use crate::common::{utils, Error, Result};
use crate::optimizer::Optimizer;
use crate::store::block::ParameterBlock;
use crate::store::tensor::Tensor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Concurrent mapping from parameter name to block
#[derive(Default)]
pub struct ParameterStore {
    blocks: RwLock<HashMap<String, Arc<RwLock<ParameterBlock>>>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a block or return the existing one's version.
    ///
    /// Idempotent: re-creating with the same shape and element type is a
    /// no-op (the supplied value is ignored); a conflicting shape fails with
    /// `ShapeMismatch`.
    pub fn create_or_get(&self, name: &str, shape: Vec<usize>, value: Tensor) -> Result<u64> {
        utils::validate_param_name(name)?;

        {
            let blocks = self.blocks.read();
            if let Some(slot) = blocks.get(name) {
                let block = slot.read();
                if !block.matches(&shape, value.element_type()) {
                    return Err(Error::ShapeMismatch {
                        expected: format!("{:?} {}", block.shape, block.element_type()),
                        actual: format!("{:?} {}", shape, value.element_type()),
                    });
                }
                return Ok(block.version);
            }
        }

        let block = ParameterBlock::new(name.to_string(), shape.clone(), value.clone())?;

        let mut blocks = self.blocks.write();
        // Lost a race with a concurrent creator: fall back to the idempotent path.
        if let Some(slot) = blocks.get(name) {
            let existing = slot.read();
            if !existing.matches(&shape, value.element_type()) {
                return Err(Error::ShapeMismatch {
                    expected: format!("{:?} {}", existing.shape, existing.element_type()),
                    actual: format!("{:?} {}", shape, value.element_type()),
                });
            }
            return Ok(existing.version);
        }
        blocks.insert(name.to_string(), Arc::new(RwLock::new(block)));
        Ok(0)
    }

    /// Apply one gradient step to a block under its exclusive lock.
    ///
    /// Validation happens before any element is written, so a rejected
    /// update leaves the block untouched. Returns the new version.
    pub fn apply_update(
        &self,
        name: &str,
        grad: &Tensor,
        optimizer: &dyn Optimizer,
    ) -> Result<u64> {
        let slot = self.lookup(name)?;
        let mut block = slot.write();
        block.value.check_compatible(grad)?;

        let ParameterBlock { value, state, .. } = &mut *block;
        optimizer.step(value, state, grad)?;

        block.version += 1;
        Ok(block.version)
    }

    /// Copy a block's value and version under a brief read lock. Callers
    /// never observe a torn buffer.
    pub fn read_snapshot(&self, name: &str) -> Result<(Tensor, u64)> {
        let slot = self.lookup(name)?;
        let block = slot.read();
        Ok((block.value.clone(), block.version))
    }

    /// Sorted snapshot of the current block names.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blocks.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Clone every block under its own read lock, in name order.
    ///
    /// Holds no global lock across block copies, so concurrent updates keep
    /// flowing; each copy carries its own version tag instead.
    pub fn export(&self) -> Vec<ParameterBlock> {
        let slots: Vec<Arc<RwLock<ParameterBlock>>> = {
            let blocks = self.blocks.read();
            blocks.values().cloned().collect()
        };

        let mut out: Vec<ParameterBlock> = slots.iter().map(|s| s.read().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Replace the store contents wholesale. Startup restore only; the
    /// service never calls this while serving traffic.
    pub fn import(&self, restored: Vec<ParameterBlock>) {
        let mut blocks = self.blocks.write();
        blocks.clear();
        for block in restored {
            blocks.insert(block.name.clone(), Arc::new(RwLock::new(block)));
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<RwLock<ParameterBlock>>> {
        self.blocks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tensor::ElementType;

    struct AddOptimizer;

    impl Optimizer for AddOptimizer {
        fn name(&self) -> &'static str {
            "add"
        }

        fn step(&self, value: &mut Tensor, _state: &mut Tensor, grad: &Tensor) -> Result<()> {
            value.check_compatible(grad)?;
            match (value, grad) {
                (Tensor::F32(w), Tensor::F32(g)) => {
                    w.iter_mut().zip(g).for_each(|(w, g)| *w += g)
                }
                (Tensor::F64(w), Tensor::F64(g)) => {
                    w.iter_mut().zip(g).for_each(|(w, g)| *w += g)
                }
                _ => unreachable!(),
            }
            Ok(())
        }
    }

    fn zeros_f32(store: &ParameterStore, name: &str, len: usize) {
        store
            .create_or_get(name, vec![len], Tensor::zeros(ElementType::F32, len))
            .unwrap();
    }

    #[test]
    fn test_create_is_idempotent() {
        let store = ParameterStore::new();
        zeros_f32(&store, "w", 4);
        let version = store
            .create_or_get("w", vec![4], Tensor::F32(vec![9.0; 4]))
            .unwrap();
        assert_eq!(version, 0);

        // Retransmitted create never clobbers the value
        let (value, _) = store.read_snapshot("w").unwrap();
        assert_eq!(value, Tensor::F32(vec![0.0; 4]));
    }

    #[test]
    fn test_create_shape_conflict() {
        let store = ParameterStore::new();
        zeros_f32(&store, "w", 4);

        let err = store.create_or_get("w", vec![5], Tensor::zeros(ElementType::F32, 5));
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));

        let err = store.create_or_get("w", vec![4], Tensor::zeros(ElementType::F64, 4));
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_version_counts_applied_updates() {
        let store = ParameterStore::new();
        zeros_f32(&store, "w", 2);

        for i in 1..=5u64 {
            let v = store
                .apply_update("w", &Tensor::F32(vec![1.0, 1.0]), &AddOptimizer)
                .unwrap();
            assert_eq!(v, i);
        }

        let (value, version) = store.read_snapshot("w").unwrap();
        assert_eq!(version, 5);
        assert_eq!(value, Tensor::F32(vec![5.0, 5.0]));
    }

    #[test]
    fn test_rejected_update_leaves_state() {
        let store = ParameterStore::new();
        zeros_f32(&store, "w", 2);

        let err = store.apply_update("w", &Tensor::F32(vec![1.0; 3]), &AddOptimizer);
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));

        let err = store.apply_update("missing", &Tensor::F32(vec![1.0; 2]), &AddOptimizer);
        assert!(matches!(err, Err(Error::UnknownParameter(_))));

        let (value, version) = store.read_snapshot("w").unwrap();
        assert_eq!(version, 0);
        assert_eq!(value, Tensor::F32(vec![0.0, 0.0]));
    }

    #[test]
    fn test_list_names_sorted() {
        let store = ParameterStore::new();
        zeros_f32(&store, "b", 1);
        zeros_f32(&store, "a", 1);
        zeros_f32(&store, "c", 1);
        assert_eq!(store.list_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_export_import_round_trip() {
        let store = ParameterStore::new();
        zeros_f32(&store, "w1", 3);
        zeros_f32(&store, "w2", 2);
        store
            .apply_update("w1", &Tensor::F32(vec![1.0; 3]), &AddOptimizer)
            .unwrap();

        let exported = store.export();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].name, "w1");
        assert_eq!(exported[0].version, 1);

        let restored = ParameterStore::new();
        restored.import(exported);
        let (value, version) = restored.read_snapshot("w1").unwrap();
        assert_eq!(version, 1);
        assert_eq!(value, Tensor::F32(vec![1.0; 3]));
        assert_eq!(restored.read_snapshot("w2").unwrap().1, 0);
    }

    #[test]
    fn test_no_torn_reads_under_contention() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let store = Arc::new(ParameterStore::new());
        zeros_f32(&store, "w", 64);
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    store
                        .apply_update("w", &Tensor::F32(vec![1.0; 64]), &AddOptimizer)
                        .unwrap();
                }
            })
        };

        // Every element was bumped by 1 per update, so a consistent copy is
        // uniform and equal to its version.
        for _ in 0..2_000 {
            let (value, version) = store.read_snapshot("w").unwrap();
            let Tensor::F32(v) = value else { unreachable!() };
            assert!(v.iter().all(|&x| x == version as f32), "torn read observed");
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn test_distinct_blocks_update_in_parallel() {
        let store = Arc::new(ParameterStore::new());
        for i in 0..4 {
            zeros_f32(&store, &format!("w{i}"), 16);
        }

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let name = format!("w{i}");
                    for _ in 0..500 {
                        store
                            .apply_update(&name, &Tensor::F32(vec![1.0; 16]), &AddOptimizer)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for i in 0..4 {
            let (value, version) = store.read_snapshot(&format!("w{i}")).unwrap();
            assert_eq!(version, 500);
            assert_eq!(value, Tensor::F32(vec![500.0; 16]));
        }
    }
}
