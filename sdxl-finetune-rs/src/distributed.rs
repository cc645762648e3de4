//! Collective primitives across data-parallel replicas.
//!
//! Replicas only meet at explicit points: the gradient all-reduce at each
//! sync boundary, the epoch-end barrier, the barriers around saves and samples,
//! and the cleanup barrier. Every replica must call the same sequence of
//! collectives or the group deadlocks.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::error::{FinetuneError, Result};

/// Barrier and all-reduce over a fixed group of replicas.
pub trait Collective: Send + Sync {
    /// Index of this replica, `0..world_size`.
    fn rank(&self) -> usize;

    /// Number of replicas.
    fn world_size(&self) -> usize;

    /// Whether this replica performs side effects for the group.
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Blocks until every replica has reached the barrier.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Collective`] if the group is broken.
    fn barrier(&self) -> Result<()>;

    /// Replaces `values` with their element-wise mean across replicas.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Collective`] if replicas disagree on the length.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()>;

    /// True on every replica if `flag` is true on any replica.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Collective`] if the reduction fails.
    fn any(&self, flag: bool) -> Result<bool> {
        let mut value = [if flag { 1.0 } else { 0.0 }];
        self.all_reduce_mean(&mut value)?;
        Ok(value[0] > 0.0)
    }
}

/// The single-process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn any(&self, flag: bool) -> Result<bool> {
        Ok(flag)
    }
}

#[derive(Debug, Default)]
struct Reduction {
    sum: Vec<f32>,
    mismatch: bool,
}

#[derive(Debug)]
struct GroupShared {
    world_size: usize,
    barrier: Barrier,
    reduction: Mutex<Reduction>,
}

/// One replica's handle on an in-process group of threads.
///
/// # Example
///
/// ```rust
/// use std::thread;
/// use sdxl_finetune_rs::distributed::{Collective, ThreadGroup};
///
/// # fn main() -> sdxl_finetune_rs::Result<()> {
/// let handles: Vec<_> = ThreadGroup::create(2)?
///     .into_iter()
///     .map(|replica| {
///         thread::spawn(move || {
///             let mut grads = [replica.rank() as f32 * 2.0];
///             replica.all_reduce_mean(&mut grads).map(|()| grads[0])
///         })
///     })
///     .collect();
/// for handle in handles {
///     assert_eq!(handle.join().unwrap()?, 1.0);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl ThreadGroup {
    /// Creates `world_size` connected replica handles, one per thread.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `world_size` is zero.
    pub fn create(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(FinetuneError::Config("world_size must be >= 1".into()));
        }
        let shared = Arc::new(GroupShared {
            world_size,
            barrier: Barrier::new(world_size),
            reduction: Mutex::new(Reduction::default()),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        // The previous reduction ended on a barrier, so nobody is still reading.
        if self.rank == 0 {
            let mut reduction = self.shared.reduction.lock();
            reduction.sum.clear();
            reduction.sum.resize(values.len(), 0.0);
            reduction.mismatch = false;
        }
        self.shared.barrier.wait();

        {
            let mut reduction = self.shared.reduction.lock();
            if reduction.sum.len() == values.len() {
                for (acc, v) in reduction.sum.iter_mut().zip(values.iter()) {
                    *acc += v;
                }
            } else {
                reduction.mismatch = true;
            }
        }
        self.shared.barrier.wait();

        let result = {
            let reduction = self.shared.reduction.lock();
            if reduction.mismatch {
                Err(FinetuneError::Collective(format!(
                    "replicas disagree on all-reduce length (rank {} has {})",
                    self.rank,
                    values.len()
                )))
            } else {
                let scale = 1.0 / self.shared.world_size as f32;
                for (v, acc) in values.iter_mut().zip(&reduction.sum) {
                    *v = acc * scale;
                }
                Ok(())
            }
        };
        self.shared.barrier.wait();
        result
    }
}

/// Rank and group size of this process as announced by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Global rank.
    pub rank: usize,
    /// Number of processes.
    pub world_size: usize,
    /// Rank on this host.
    pub local_rank: usize,
}

impl Default for ProcessInfo {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }
}

impl ProcessInfo {
    /// Reads `RANK`, `WORLD_SIZE` and `LOCAL_RANK`, defaulting to a single process.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a variable is not a number or the rank
    /// is outside the group.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ProcessInfo::from_env`] with a custom variable source.
    ///
    /// # Errors
    ///
    /// See [`ProcessInfo::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str, default: usize| -> Result<usize> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw.trim().parse().map_err(|_| {
                    FinetuneError::Config(format!("{key}={raw:?} is not a non-negative integer"))
                }),
            }
        };
        let info = Self {
            rank: read("RANK", 0)?,
            world_size: read("WORLD_SIZE", 1)?,
            local_rank: read("LOCAL_RANK", 0)?,
        };
        if info.world_size == 0 || info.rank >= info.world_size {
            return Err(FinetuneError::Config(format!(
                "rank {} is outside a group of {}",
                info.rank, info.world_size
            )));
        }
        Ok(info)
    }

    /// Whether this is rank 0.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}
