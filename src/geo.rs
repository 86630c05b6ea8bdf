//! Coarse proximity between Indian PIN codes.
//!
//! There is no geocoding here. Distances are banded estimates derived from how far
//! apart two PIN codes are numerically, which tracks the postal hierarchy
//! (zone, sub-zone, sorting district) well enough to rank nearby sellers first.

use serde::Serialize;

pub fn is_valid_pin(pin: &str) -> bool {
    let pin = pin.trim();
    pin.len() == 6 && pin.chars().all(|c| c.is_ascii_digit()) && !pin.starts_with('0')
}

fn parse_pin(pin: &str) -> Option<u32> {
    if is_valid_pin(pin) {
        pin.trim().parse().ok()
    } else {
        None
    }
}

/// Estimated road distance in kilometres, or `None` when either PIN is malformed.
pub fn estimate_distance_km(from: &str, to: &str) -> Option<f64> {
    let a = parse_pin(from)?;
    let b = parse_pin(to)?;

    let km = match a.abs_diff(b) {
        0 => 0.0,
        1..=9 => 3.5,
        10..=99 => 15.0,
        100..=999 => 75.0,
        _ => 350.0,
    };
    Some(km)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Location {
    pub city: String,
    pub state: String,
}

const KNOWN_PREFIXES: &[(&str, &str, &str)] = &[
    ("110", "New Delhi", "Delhi"),
    ("400", "Mumbai", "Maharashtra"),
    ("560", "Bangalore", "Karnataka"),
    ("600", "Chennai", "Tamil Nadu"),
    ("700", "Kolkata", "West Bengal"),
    ("500", "Hyderabad", "Telangana"),
];

fn postal_zone(first_digit: char) -> &'static str {
    match first_digit {
        '1' => "Delhi, Haryana, Punjab, Himachal Pradesh, Jammu & Kashmir",
        '2' => "Uttar Pradesh, Uttarakhand",
        '3' => "Rajasthan, Gujarat",
        '4' => "Maharashtra, Madhya Pradesh, Chhattisgarh, Goa",
        '5' => "Andhra Pradesh, Telangana, Karnataka",
        '6' => "Tamil Nadu, Kerala",
        '7' => "West Bengal, Odisha, North East",
        '8' => "Bihar, Jharkhand",
        _ => "Army Postal Service",
    }
}

pub fn locate(pin: &str) -> Option<Location> {
    if !is_valid_pin(pin) {
        return None;
    }
    let pin = pin.trim();

    if let Some((_, city, state)) = KNOWN_PREFIXES.iter().find(|(prefix, _, _)| pin.starts_with(prefix)) {
        return Some(Location {
            city: city.to_string(),
            state: state.to_string(),
        });
    }

    let zone = pin.chars().next().map(postal_zone)?;
    Some(Location {
        city: format!("District {}", &pin[..3]),
        state: zone.to_string(),
    })
}
