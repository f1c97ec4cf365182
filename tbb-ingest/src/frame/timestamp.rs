//! Clock-defect correction for TBB frame timestamps.
//!
//! Some board firmware stamps frames taken in the second half of a 200 MHz
//! second with the wrong `(second, sample)` pair. Two heuristics undo this:
//! the `Legacy` one tracks whether the previous frame fell in an odd second,
//! the `Current` one only shifts even seconds by half a frame block.

use std::fmt;
use std::str::FromStr;

use super::Header;

/// Half a second's worth of misplacement, in samples.
pub const HALF_STEP: u32 = 512;

/// Last sample offset a 200 MHz board reports inside one second.
pub const LAST_SAMPLE_200MHZ: u32 = 199_999_488;

/// Second-to-last frame offset at 200 MHz, stamped one second late after an odd second.
pub const CARRY_SAMPLE_200MHZ: u32 = 199_998_464;

/// Last sample offset a 160 MHz board reports inside one second.
pub const LAST_SAMPLE_160MHZ: u32 = 159_998_976;

/// Which correction to apply to incoming headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorrectionPolicy {
    Off,
    Legacy,
    #[default]
    Current,
}

impl FromStr for CorrectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "off" | "none" => Ok(Self::Off),
            "1" | "legacy" | "old" => Ok(Self::Legacy),
            "2" | "current" | "new" => Ok(Self::Current),
            other => Err(format!(
                "unknown correction policy '{other}' (expected 0/1/2 or off/legacy/current)"
            )),
        }
    }
}

impl fmt::Display for CorrectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Legacy => "legacy",
            Self::Current => "current",
        })
    }
}

/// State the legacy heuristic carries from one frame to the next.
///
/// Callers keep one of these per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    pub previous_second_odd: bool,
}

/// Outcome of [`correct`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    Unchanged,
    Adjusted,
    /// The header's sample frequency (MHz) has no known correction.
    UnsupportedRate(u8),
}

/// Rewrites `header.epoch_second` / `header.sample_offset` in place.
///
/// Only `Legacy` reads or updates `state`. Headers with an unsupported
/// sample rate are left untouched. Shifts wrap at the field bounds, so any
/// decodable header can be corrected without overflow.
pub fn correct(header: &mut Header, policy: CorrectionPolicy, state: &mut ClockState) -> Correction {
    match policy {
        CorrectionPolicy::Off => Correction::Unchanged,
        CorrectionPolicy::Legacy => correct_legacy(header, state),
        CorrectionPolicy::Current => correct_current(header),
    }
}

fn correct_legacy(header: &mut Header, state: &mut ClockState) -> Correction {
    match header.sample_freq_mhz {
        200 => {
            if header.epoch_second.rem_euclid(2) != 0 {
                if header.sample_offset == LAST_SAMPLE_200MHZ {
                    header.epoch_second = header.epoch_second.wrapping_sub(1);
                } else {
                    header.sample_offset = header.sample_offset.wrapping_add(HALF_STEP);
                    state.previous_second_odd = true;
                }
                Correction::Adjusted
            } else if state.previous_second_odd && header.sample_offset == CARRY_SAMPLE_200MHZ {
                header.epoch_second = header.epoch_second.wrapping_sub(1);
                header.sample_offset = header.sample_offset.wrapping_add(HALF_STEP);
                Correction::Adjusted
            } else {
                state.previous_second_odd = false;
                Correction::Unchanged
            }
        }
        160 => {
            if header.sample_offset == LAST_SAMPLE_160MHZ {
                header.epoch_second = header.epoch_second.wrapping_sub(1);
                Correction::Adjusted
            } else {
                Correction::Unchanged
            }
        }
        other => Correction::UnsupportedRate(other),
    }
}

fn correct_current(header: &mut Header) -> Correction {
    match header.sample_freq_mhz {
        200 if header.epoch_second.rem_euclid(2) == 0 => {
            header.sample_offset = header.sample_offset.wrapping_add(HALF_STEP);
            Correction::Adjusted
        }
        200 | 160 => Correction::Unchanged,
        other => Correction::UnsupportedRate(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(freq: u8, second: i32, sample: u32) -> Header {
        Header {
            sample_freq_mhz: freq,
            epoch_second: second,
            sample_offset: sample,
            ..Header::default()
        }
    }

    #[test]
    fn current_shifts_even_seconds_only() {
        let mut state = ClockState::default();

        let mut even = header(200, 100, 4096);
        assert_eq!(correct(&mut even, CorrectionPolicy::Current, &mut state), Correction::Adjusted);
        assert_eq!((even.epoch_second, even.sample_offset), (100, 4608));

        let mut odd = header(200, 101, 4096);
        assert_eq!(correct(&mut odd, CorrectionPolicy::Current, &mut state), Correction::Unchanged);
        assert_eq!((odd.epoch_second, odd.sample_offset), (101, 4096));

        let mut slow = header(160, 100, 4096);
        assert_eq!(correct(&mut slow, CorrectionPolicy::Current, &mut state), Correction::Unchanged);
        assert_eq!(slow.sample_offset, 4096);
        assert_eq!(state, ClockState::default());
    }

    #[test]
    fn off_leaves_header_alone() {
        let mut state = ClockState::default();
        let mut h = header(200, 100, 0);
        assert_eq!(correct(&mut h, CorrectionPolicy::Off, &mut state), Correction::Unchanged);
        assert_eq!(h, header(200, 100, 0));
    }

    #[test]
    fn legacy_odd_second() {
        let mut state = ClockState::default();

        let mut last = header(200, 101, LAST_SAMPLE_200MHZ);
        correct(&mut last, CorrectionPolicy::Legacy, &mut state);
        assert_eq!((last.epoch_second, last.sample_offset), (100, LAST_SAMPLE_200MHZ));
        assert!(!state.previous_second_odd);

        let mut mid = header(200, 101, 1024);
        correct(&mut mid, CorrectionPolicy::Legacy, &mut state);
        assert_eq!((mid.epoch_second, mid.sample_offset), (101, 1536));
        assert!(state.previous_second_odd);
    }

    #[test]
    fn legacy_carry_after_odd_second() {
        let mut state = ClockState {
            previous_second_odd: true,
        };

        let mut carry = header(200, 102, CARRY_SAMPLE_200MHZ);
        assert_eq!(correct(&mut carry, CorrectionPolicy::Legacy, &mut state), Correction::Adjusted);
        assert_eq!((carry.epoch_second, carry.sample_offset), (101, CARRY_SAMPLE_200MHZ + HALF_STEP));
        assert!(state.previous_second_odd);

        let mut plain = header(200, 102, 0);
        assert_eq!(correct(&mut plain, CorrectionPolicy::Legacy, &mut state), Correction::Unchanged);
        assert!(!state.previous_second_odd);

        // Without the flag the carry sentinel is just another sample.
        let mut again = header(200, 102, CARRY_SAMPLE_200MHZ);
        assert_eq!(correct(&mut again, CorrectionPolicy::Legacy, &mut state), Correction::Unchanged);
        assert_eq!(again.epoch_second, 102);
    }

    #[test]
    fn legacy_160mhz_sentinel() {
        let mut state = ClockState::default();

        let mut last = header(160, 55, LAST_SAMPLE_160MHZ);
        assert_eq!(correct(&mut last, CorrectionPolicy::Legacy, &mut state), Correction::Adjusted);
        assert_eq!(last.epoch_second, 54);

        let mut other = header(160, 55, 0);
        assert_eq!(correct(&mut other, CorrectionPolicy::Legacy, &mut state), Correction::Unchanged);
        assert_eq!(other.epoch_second, 55);
    }

    #[test]
    fn unsupported_rate_is_reported() {
        let mut state = ClockState::default();
        for policy in [CorrectionPolicy::Legacy, CorrectionPolicy::Current] {
            let mut h = header(120, 100, 0);
            assert_eq!(correct(&mut h, policy, &mut state), Correction::UnsupportedRate(120));
            assert_eq!(h, header(120, 100, 0));
        }
    }

    #[test]
    fn shifts_wrap_at_field_bounds() {
        let mut state = ClockState::default();

        let mut oldest = header(160, i32::MIN, LAST_SAMPLE_160MHZ);
        assert_eq!(correct(&mut oldest, CorrectionPolicy::Legacy, &mut state), Correction::Adjusted);
        assert_eq!(oldest.epoch_second, i32::MAX);

        let mut late = header(200, 100, u32::MAX - 10);
        assert_eq!(correct(&mut late, CorrectionPolicy::Current, &mut state), Correction::Adjusted);
        assert_eq!(late.sample_offset, HALF_STEP - 11);

        let mut odd = header(200, i32::MIN + 1, u32::MAX);
        correct(&mut odd, CorrectionPolicy::Legacy, &mut state);
        assert_eq!(odd.sample_offset, HALF_STEP - 1);

        let mut carry = header(200, i32::MIN, CARRY_SAMPLE_200MHZ);
        assert!(state.previous_second_odd);
        correct(&mut carry, CorrectionPolicy::Legacy, &mut state);
        assert_eq!((carry.epoch_second, carry.sample_offset), (i32::MAX, CARRY_SAMPLE_200MHZ + HALF_STEP));
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("0".parse(), Ok(CorrectionPolicy::Off));
        assert_eq!("legacy".parse(), Ok(CorrectionPolicy::Legacy));
        assert_eq!("2".parse(), Ok(CorrectionPolicy::Current));
        assert_eq!("Current".parse(), Ok(CorrectionPolicy::Current));
        assert!("3".parse::<CorrectionPolicy>().is_err());
        assert_eq!(CorrectionPolicy::default().to_string(), "current");
    }
}
