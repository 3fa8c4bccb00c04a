//! Threshold decisions.  Boundary values count as in range.

pub fn below_min(value: f64, min: f64) -> bool {
    value < min
}

pub fn above_max(value: f64, max: f64) -> bool {
    value > max
}

/// Battery hysteresis: disable below `low`, re-enable only above `high`, and
/// hold the current state anywhere in between.
pub fn battery_safe(voltage: f64, low: f64, high: f64, currently_enabled: bool) -> bool {
    if voltage < low {
        false
    } else if currently_enabled {
        true
    } else {
        voltage > high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_strict() {
        assert!(below_min(29.9, 30.0));
        assert!(!below_min(30.0, 30.0));
        assert!(above_max(80.1, 80.0));
        assert!(!above_max(80.0, 80.0));
    }

    #[test]
    fn battery_disables_below_low() {
        assert!(!battery_safe(10.9, 11.0, 14.0, true));
        assert!(battery_safe(11.0, 11.0, 14.0, true));
    }

    #[test]
    fn battery_stays_disabled_until_strictly_above_high() {
        let mut enabled = battery_safe(10.5, 11.0, 14.0, true);
        assert!(!enabled);
        for v in [11.0, 11.5, 12.8, 13.99, 14.0] {
            enabled = battery_safe(v, 11.0, 14.0, enabled);
            assert!(!enabled, "re-enabled too early at {v} V");
        }
        enabled = battery_safe(14.01, 11.0, 14.0, enabled);
        assert!(enabled);
    }

    #[test]
    fn battery_holds_enabled_between_thresholds() {
        for v in [11.0, 12.0, 13.9, 14.0] {
            assert!(battery_safe(v, 11.0, 14.0, true));
        }
    }
}
