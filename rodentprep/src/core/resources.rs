//! Resource requests and run budgets.

use crate::errors::ResourceBudgetError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Resources a step reserves while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Threads the step's action may use internally.
    pub cpu_threads: usize,
    /// Peak memory in gigabytes.
    pub mem_gb: f64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu_threads: 1,
            mem_gb: 0.0,
        }
    }
}

impl ResourceRequest {
    /// Requests `cpu_threads` threads and no explicit memory.
    #[must_use]
    pub fn threads(cpu_threads: usize) -> Self {
        Self {
            cpu_threads,
            ..Self::default()
        }
    }

    /// Sets the memory request.
    #[must_use]
    pub fn with_mem_gb(mut self, mem_gb: f64) -> Self {
        self.mem_gb = mem_gb;
        self
    }
}

/// The resource ceiling for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// Total threads available to concurrently running steps.
    pub nprocs: usize,
    /// Maximum threads any single step may use.
    pub omp_nthreads: usize,
    /// Total memory available to concurrently running steps, if bounded.
    pub mem_gb: Option<f64>,
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl Budget {
    /// Creates a budget.
    ///
    /// Zero values are raised to one, and `omp_nthreads` is clamped to
    /// `nprocs` since a single step can never use more than the whole pool.
    #[must_use]
    pub fn new(nprocs: usize, omp_nthreads: usize) -> Self {
        let nprocs = nprocs.max(1);
        let mut omp = omp_nthreads.max(1);
        if omp > nprocs {
            warn!(
                omp_nthreads = omp,
                nprocs, "Per-step thread count exceeds total threads; clamping"
            );
            omp = nprocs;
        }
        Self {
            nprocs,
            omp_nthreads: omp,
            mem_gb: None,
        }
    }

    /// Bounds total memory.
    #[must_use]
    pub fn with_mem_gb(mut self, mem_gb: f64) -> Self {
        self.mem_gb = Some(mem_gb);
        self
    }

    /// Checks that a single request could ever be admitted under this budget.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceBudgetError`] naming the first exceeded resource.
    pub fn admits(&self, step: &str, request: &ResourceRequest) -> Result<(), ResourceBudgetError> {
        let over = |resource, requested: f64, limit: f64| ResourceBudgetError {
            step: step.to_string(),
            resource,
            requested,
            limit,
        };

        if request.cpu_threads > self.nprocs {
            return Err(over(
                "cpu_threads",
                request.cpu_threads as f64,
                self.nprocs as f64,
            ));
        }
        if request.cpu_threads > self.omp_nthreads {
            return Err(over(
                "omp_nthreads",
                request.cpu_threads as f64,
                self.omp_nthreads as f64,
            ));
        }
        if let Some(limit) = self.mem_gb {
            if request.mem_gb > limit {
                return Err(over("mem_gb", request.mem_gb, limit));
            }
        }
        Ok(())
    }
}
