//! Pool configuration knobs.

use tracing::warn;

/// Configuration for sizing and policy of the frame pool.
///
/// `pool_size` is a request; the effective size is clamped against both the
/// `min_surfaces`/`max_surfaces` knobs and the surface budget advertised by
/// the selected presentation back-end.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Requested number of decoder-visible frame slots.
    pub pool_size: usize,
    /// Free slots held back from the decoder so overlay acquisition can
    /// always make progress on overlay-limited back-ends.
    pub reserved_for_overlay: usize,
    /// Lower bound on the effective pool size.
    pub min_surfaces: u32,
    /// Upper bound on the effective pool size.
    pub max_surfaces: u32,
    /// Number of submitted frames required before display may start.
    pub frames_needed_before_display: usize,
    /// Enable the deep-free-sweep reclamation mode: proactively detach and
    /// reclaim overlay children whose rendering has completed, trading
    /// safety margin for pool headroom.
    pub aggressive_reclaim: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            reserved_for_overlay: 1,
            min_surfaces: 2,
            max_surfaces: 32,
            frames_needed_before_display: 1,
            aggressive_reclaim: false,
        }
    }
}

impl PoolConfig {
    /// Returns the effective pool size after clamping against this config's
    /// own bounds and the back-end's advertised surface budget.
    ///
    /// Out-of-range requests are clamped and logged rather than rejected.
    pub fn effective_pool_size(&self, backend_budget: (u32, u32)) -> usize {
        let (backend_min, backend_max) = backend_budget;
        let lo = self.min_surfaces.max(backend_min) as usize;
        let hi = self.max_surfaces.min(backend_max).max(1) as usize;
        let clamped = self.pool_size.clamp(lo.min(hi), hi);
        if clamped != self.pool_size {
            warn!(
                "pool_size {} clamped to {} (config bounds {}..={}, back-end budget {}..={})",
                self.pool_size, clamped, self.min_surfaces, self.max_surfaces, backend_min, backend_max
            );
        }
        clamped
    }

    /// Returns the overlay reservation, capped so the decoder always keeps
    /// at least one usable slot.
    pub fn effective_overlay_reservation(&self, pool_size: usize) -> usize {
        if self.reserved_for_overlay + 1 >= pool_size {
            let capped = pool_size.saturating_sub(2);
            if capped != self.reserved_for_overlay {
                warn!(
                    "reserved_for_overlay {} leaves no decoder slots in a pool of {}, capping to {}",
                    self.reserved_for_overlay, pool_size, capped
                );
            }
            capped
        } else {
            self.reserved_for_overlay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_pool_size_clamps_to_backend() {
        let cfg = PoolConfig {
            pool_size: 64,
            ..Default::default()
        };
        assert_eq!(cfg.effective_pool_size((1, 16)), 16);
    }

    #[test]
    fn test_effective_pool_size_respects_min() {
        let cfg = PoolConfig {
            pool_size: 1,
            min_surfaces: 4,
            ..Default::default()
        };
        assert_eq!(cfg.effective_pool_size((1, 32)), 4);
    }

    #[test]
    fn test_overlay_reservation_capped() {
        let cfg = PoolConfig {
            reserved_for_overlay: 4,
            ..Default::default()
        };
        assert_eq!(cfg.effective_overlay_reservation(4), 2);
        assert_eq!(cfg.effective_overlay_reservation(8), 4);
    }
}
