//! Resource reservations against the run budget.

use crate::core::{Budget, ResourceRequest};

/// A granted reservation. Hand it back to [`ResourcePool::release`] when the
/// step finishes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "a reservation must be released"]
pub struct Reservation {
    cpu_threads: usize,
    mem_gb: f64,
}

impl Reservation {
    /// Threads held by this reservation.
    #[must_use]
    pub fn cpu_threads(&self) -> usize {
        self.cpu_threads
    }
}

/// Tracks how much of the budget running steps hold.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    budget: Budget,
    cpu_in_use: usize,
    mem_in_use: f64,
    peak_cpu: usize,
}

impl ResourcePool {
    /// Creates an empty pool for `budget`.
    #[must_use]
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            cpu_in_use: 0,
            mem_in_use: 0.0,
            peak_cpu: 0,
        }
    }

    /// Reserves `request` if it fits in what is left of the budget.
    ///
    /// Inline requests always succeed and hold nothing.
    pub fn try_reserve(&mut self, request: &ResourceRequest, inline: bool) -> Option<Reservation> {
        if inline {
            return Some(Reservation {
                cpu_threads: 0,
                mem_gb: 0.0,
            });
        }
        if request.cpu_threads > self.budget.omp_nthreads {
            return None;
        }
        if self.cpu_in_use + request.cpu_threads > self.budget.nprocs {
            return None;
        }
        if let Some(limit) = self.budget.mem_gb {
            if self.mem_in_use + request.mem_gb > limit {
                return None;
            }
        }

        self.cpu_in_use += request.cpu_threads;
        self.mem_in_use += request.mem_gb;
        self.peak_cpu = self.peak_cpu.max(self.cpu_in_use);
        Some(Reservation {
            cpu_threads: request.cpu_threads,
            mem_gb: request.mem_gb,
        })
    }

    /// Returns a reservation to the pool.
    pub fn release(&mut self, reservation: Reservation) {
        self.cpu_in_use = self.cpu_in_use.saturating_sub(reservation.cpu_threads);
        self.mem_in_use = (self.mem_in_use - reservation.mem_gb).max(0.0);
    }

    /// Threads currently reserved.
    #[must_use]
    pub fn cpu_in_use(&self) -> usize {
        self.cpu_in_use
    }

    /// Highest number of threads reserved at once.
    #[must_use]
    pub fn peak_cpu(&self) -> usize {
        self.peak_cpu
    }

    /// Returns true if nothing is reserved.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.cpu_in_use == 0 && self.mem_in_use <= f64::EPSILON
    }
}
