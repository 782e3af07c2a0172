//! XG brightness (CC74) shaping for FM modulators.
//!
//! Brightness dims the modulator operators, which on FM narrows the
//! spectrum instead of lowering loudness. The curve is the XG square-root
//! mapping; values at or above the center leave the timbre untouched
//! unless full-range mode widens the controller domain.

/// Maps a raw CC74 value onto the effective brightness amount.
///
/// In the default (XG-compatible) mode only the lower half of the
/// controller dims the timbre: 0..=63 maps to 0..=126 and everything from
/// the center up is neutral. Full-range mode uses the whole 0..=127 domain
/// verbatim.
#[inline]
pub fn effective_brightness(cc74: u8, full_range: bool) -> u8 {
    if full_range {
        cc74
    } else if cc74 >= 64 {
        127
    } else {
        cc74 * 2
    }
}

/// The XG square-root brightness curve: `round(127 * sqrt(b / 127))`.
///
/// Neutral input (127) stays neutral; everything else bends upward so that
/// mid-range controller values keep most of the timbre.
#[inline]
pub fn xg_brightness_curve(brightness: u8) -> u8 {
    (127.0 * f64::sqrt(f64::from(brightness) * (1.0 / 127.0))).round() as u8
}
