//! Time
//!
//! System time is an `i64` count of 100 ns ticks since the Unix epoch. The
//! only clock is the TSC; the boot stub calibrates its frequency against
//! the PIT and reads the RTC once, and everything else is linear
//! conversion from the (boot-TSC, boot-timestamp) anchor.

use core::sync::atomic::Ordering;

use sable_abi::time::{days_from_civil, TICKS_PER_SEC};
use spin::Once;

use crate::arch;
use crate::sched;
use crate::sched::wait;

/// Length of one timeslice, in ticks (10 ms).
pub const TIMESLICE_TICKS: i64 = 100_000;

struct TimeBase {
    tsc_frequency: u64,
    boot_tsc: u64,
    boot_timestamp: i64,
}

static TIME_BASE: Once<TimeBase> = Once::new();

/// Anchor the clock. `boot_timestamp` is the RTC reading at boot.
///
/// Must run before the first deadline is armed.
pub fn init(tsc_frequency_hz: u64, boot_timestamp: i64) {
    TIME_BASE.call_once(|| TimeBase {
        tsc_frequency: tsc_frequency_hz.max(1),
        boot_tsc: arch::rdtsc(),
        boot_timestamp,
    });
}

fn base() -> &'static TimeBase {
    // Before calibration (and in host tests) run with a 1:1 anchor at zero.
    static FALLBACK: TimeBase = TimeBase {
        tsc_frequency: TICKS_PER_SEC as u64,
        boot_tsc: 0,
        boot_timestamp: 0,
    };
    TIME_BASE.get().unwrap_or(&FALLBACK)
}

/// Current timestamp.
pub fn now() -> i64 {
    tsc_to_timestamp(arch::rdtsc())
}

/// Convert a TSC reading to a timestamp.
pub fn tsc_to_timestamp(tsc: u64) -> i64 {
    let base = base();
    let delta = tsc.wrapping_sub(base.boot_tsc) as i128;
    let ticks = delta * TICKS_PER_SEC as i128 / base.tsc_frequency as i128;
    base.boot_timestamp.saturating_add(ticks as i64)
}

/// Convert a timestamp to the TSC value at which it occurs. Timestamps
/// before boot clamp to zero.
pub fn timestamp_to_tsc(timestamp: i64) -> u64 {
    let base = base();
    let ticks = (timestamp - base.boot_timestamp) as i128;
    let delta = ticks * base.tsc_frequency as i128 / TICKS_PER_SEC as i128;
    let tsc = base.boot_tsc as i128 + delta;
    tsc.clamp(0, u64::MAX as i128) as u64
}

/// Convert an elapsed TSC span to ticks.
pub fn tsc_delta_to_ticks(delta: u64) -> i64 {
    let base = base();
    (delta as i128 * TICKS_PER_SEC as i128 / base.tsc_frequency as i128) as i64
}

/// Convert a tick span to TSC units.
pub fn ticks_to_tsc_delta(ticks: i64) -> u64 {
    let base = base();
    (ticks as i128 * base.tsc_frequency as i128 / TICKS_PER_SEC as i128)
        .clamp(0, u64::MAX as i128) as u64
}

/// Arm the end-of-timeslice deadline for the process about to run.
pub fn start_timeslice() {
    wait::schedule_timeslice_interrupt(
        arch::rdtsc().saturating_add(ticks_to_tsc_delta(TIMESLICE_TICKS)),
    );
}

/// CPU time consumed by the current process, including the running slice.
pub fn process_time() -> i64 {
    let current = sched::current();
    if current.is_null() {
        return 0;
    }
    let accounted = unsafe { (*current).cpu_time.load(Ordering::Relaxed) };
    let cpu = sched::cpu_local();
    accounted + tsc_delta_to_ticks(arch::rdtsc().saturating_sub(cpu.timeslice_start))
}

/// A raw RTC reading, fields still in the register encoding.
#[derive(Debug, Clone, Copy)]
pub struct RtcTime {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    /// Years since 2000.
    pub year: u8,
}

/// RTC status register B: hours are binary 24-hour.
pub const STATUS_B_24_HOUR: u8 = 2;
/// RTC status register B: values are binary rather than BCD.
pub const STATUS_B_BINARY: u8 = 4;

fn from_bcd(value: u8) -> u8 {
    10 * (value >> 4) + (value & 0x0F)
}

/// Decode an RTC reading into a timestamp.
///
/// Handles BCD and 12-hour encodings according to `status_b`; the year is
/// assumed to be 2000-2099.
pub fn convert_time_from_rtc(mut rtc: RtcTime, status_b: u8) -> i64 {
    // The top hour bit marks PM in 12-hour mode; strip it either way.
    let hour_pm = rtc.hour & 0x80 != 0;
    rtc.hour &= 0x7F;
    if status_b & STATUS_B_BINARY == 0 {
        rtc.second = from_bcd(rtc.second);
        rtc.minute = from_bcd(rtc.minute);
        rtc.hour = from_bcd(rtc.hour);
        rtc.day = from_bcd(rtc.day);
        rtc.month = from_bcd(rtc.month);
        rtc.year = from_bcd(rtc.year);
    }
    if status_b & STATUS_B_24_HOUR == 0 {
        if rtc.hour == 12 {
            rtc.hour = 0;
        }
        if hour_pm {
            rtc.hour += 12;
        }
    }
    let day = days_from_civil(2000 + rtc.year as i64, rtc.month as u32, rtc.day as u32);
    let second =
        rtc.second as i64 + 60 * (rtc.minute as i64 + 60 * (rtc.hour as i64 + 24 * day));
    second * TICKS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_clock_is_identity_at_zero() {
        assert_eq!(tsc_to_timestamp(12_345), 12_345);
        assert_eq!(timestamp_to_tsc(12_345), 12_345);
        assert_eq!(tsc_delta_to_ticks(500), 500);
    }

    #[test]
    fn rtc_binary_24h() {
        // 2000-01-01 00:00:00 is day 10957 after the epoch.
        let rtc = RtcTime {
            second: 0,
            minute: 0,
            hour: 0,
            day: 1,
            month: 1,
            year: 0,
        };
        let t = convert_time_from_rtc(rtc, STATUS_B_BINARY | STATUS_B_24_HOUR);
        assert_eq!(t, 10_957 * 86_400 * TICKS_PER_SEC);
    }

    #[test]
    fn rtc_bcd_decoding() {
        // 2024-12-31 23:59:59, BCD-encoded.
        let rtc = RtcTime {
            second: 0x59,
            minute: 0x59,
            hour: 0x23,
            day: 0x31,
            month: 0x12,
            year: 0x24,
        };
        let t = convert_time_from_rtc(rtc, STATUS_B_24_HOUR);
        let expected =
            sable_abi::time::timestamp_from_datetime(2024, 12, 31, 23, 59, 59);
        assert_eq!(t, expected);
    }

    #[test]
    fn rtc_12_hour_pm() {
        // 3:30:00 PM in 12-hour binary mode.
        let rtc = RtcTime {
            second: 0,
            minute: 30,
            hour: 0x80 | 3,
            day: 1,
            month: 3,
            year: 24,
        };
        let t = convert_time_from_rtc(rtc, STATUS_B_BINARY);
        let expected = sable_abi::time::timestamp_from_datetime(2024, 3, 1, 15, 30, 0);
        assert_eq!(t, expected);
    }

    #[test]
    fn rtc_12_hour_midnight() {
        // 12:00:10 AM must map to hour zero.
        let rtc = RtcTime {
            second: 10,
            minute: 0,
            hour: 12,
            day: 2,
            month: 7,
            year: 30,
        };
        let t = convert_time_from_rtc(rtc, STATUS_B_BINARY);
        let expected = sable_abi::time::timestamp_from_datetime(2030, 7, 2, 0, 0, 10);
        assert_eq!(t, expected);
    }

    #[test]
    fn leap_day_in_rtc_range() {
        let rtc = RtcTime {
            second: 0,
            minute: 0,
            hour: 12,
            day: 29,
            month: 2,
            year: 24,
        };
        let t = convert_time_from_rtc(rtc, STATUS_B_BINARY | STATUS_B_24_HOUR);
        let expected = sable_abi::time::timestamp_from_datetime(2024, 2, 29, 12, 0, 0);
        assert_eq!(t, expected);
    }
}
