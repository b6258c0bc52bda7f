//! Per-axis speed bounds and the split of a resultant speed across axes.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpeedError {
    #[error("Speed {speed} mm/s is below the minimum of {min} mm/s")]
    TooSlow { speed: f64, min: f64 },
    #[error("Speed {speed} mm/s exceeds the maximum of {max} mm/s")]
    TooFast { speed: f64, max: f64 },
    #[error("Speed must be a finite number")]
    NotFinite,
}

/// Physical per-axis speed bounds in mm/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLimits {
    pub min_axis_speed: f64,
    pub max_axis_speed: f64,
    /// Magnitudes below this snap to 0.
    pub zero_threshold: f64,
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self {
            min_axis_speed: 1e-5,
            max_axis_speed: 1.0,
            zero_threshold: 5e-6,
        }
    }
}

impl SpeedLimits {
    /// Fastest resultant speed: every axis at its own maximum.
    pub fn max_resultant(&self) -> f64 {
        3f64.sqrt() * self.max_axis_speed
    }

    pub fn validate_speed(&self, speed: f64) -> Result<(), SpeedError> {
        if !speed.is_finite() {
            return Err(SpeedError::NotFinite);
        }
        if speed < self.min_axis_speed {
            return Err(SpeedError::TooSlow {
                speed,
                min: self.min_axis_speed,
            });
        }
        if speed > self.max_resultant() {
            return Err(SpeedError::TooFast {
                speed,
                max: self.max_resultant(),
            });
        }
        Ok(())
    }

    /// Snaps tiny magnitudes to 0 and clamps the rest into
    /// `[min_axis_speed, max_axis_speed]`, keeping the sign.
    pub fn adjust_axis_speed(&self, speed: f64) -> f64 {
        if !speed.is_finite() {
            return 0.0;
        }

        let magnitude = speed.abs();
        if magnitude < self.zero_threshold {
            0.0
        } else if magnitude < self.min_axis_speed {
            self.min_axis_speed.copysign(speed)
        } else if magnitude > self.max_axis_speed {
            self.max_axis_speed.copysign(speed)
        } else {
            speed
        }
    }

    /// Splits `speed` across axes in proportion to `deltas`.
    ///
    /// Components that had to be clamped keep their clamped value; the rest
    /// are rescaled so the norm stays at `speed` where the bounds allow it.
    /// Axes with `|delta| <= skip_below` get 0 and must not be commanded.
    pub fn decompose(&self, speed: f64, deltas: [f64; 3], skip_below: f64) -> [f64; 3] {
        let distance = norm(deltas);
        if distance == 0.0 || !distance.is_finite() {
            return [0.0; 3];
        }

        let mut speeds = deltas.map(|delta| {
            if delta.abs() <= skip_below {
                0.0
            } else {
                (speed * delta / distance).abs()
            }
        });
        let mut pinned = speeds.map(|s| s == 0.0);

        for _ in 0..speeds.len() {
            let mut changed = false;
            for (s, pin) in speeds.iter_mut().zip(pinned.iter_mut()) {
                let adjusted = self.adjust_axis_speed(*s);
                if !*pin && adjusted != *s {
                    *s = adjusted;
                    *pin = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let (pinned_sq, free_sq) = speeds.iter().zip(pinned.iter()).fold(
                (0.0, 0.0),
                |(p, f), (s, pin)| if *pin { (p + s * s, f) } else { (p, f + s * s) },
            );
            if free_sq == 0.0 {
                break;
            }

            let scale = ((speed * speed - pinned_sq).max(0.0) / free_sq).sqrt();
            for (s, pin) in speeds.iter_mut().zip(pinned.iter()) {
                if !*pin {
                    *s *= scale;
                }
            }
        }

        speeds.map(|s| self.adjust_axis_speed(s))
    }
}

pub fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}
