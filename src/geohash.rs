//! Geohash encoding and the viewport→tile mapping used by the tile cache.

use std::collections::BTreeSet;

use crate::models::provider::BoundingBox;

const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub fn encode(lat: f64, lng: f64, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lng_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut bits = 0u8;
    let mut ch = 0usize;
    let mut even = true; // even bits refine longitude
    while hash.len() < precision {
        if even {
            let mid = (lng_range.0 + lng_range.1) / 2.0;
            if lng >= mid {
                ch = (ch << 1) | 1;
                lng_range.0 = mid;
            } else {
                ch <<= 1;
                lng_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                ch = (ch << 1) | 1;
                lat_range.0 = mid;
            } else {
                ch <<= 1;
                lat_range.1 = mid;
            }
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            hash.push(BASE32[ch] as char);
            bits = 0;
            ch = 0;
        }
    }
    hash
}

/// Bounding box of a geohash cell. None for an empty hash or a character
/// outside the base-32 alphabet.
pub fn decode_bounds(hash: &str) -> Option<BoundingBox> {
    if hash.is_empty() {
        return None;
    }
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lng_range = (-180.0_f64, 180.0_f64);
    let mut even = true;
    for c in hash.bytes() {
        let idx = BASE32.iter().position(|&b| b == c.to_ascii_lowercase())?;
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1;
            if even {
                let mid = (lng_range.0 + lng_range.1) / 2.0;
                if bit == 1 {
                    lng_range.0 = mid;
                } else {
                    lng_range.1 = mid;
                }
            } else {
                let mid = (lat_range.0 + lat_range.1) / 2.0;
                if bit == 1 {
                    lat_range.0 = mid;
                } else {
                    lat_range.1 = mid;
                }
            }
            even = !even;
        }
    }
    Some(BoundingBox {
        north: lat_range.1,
        south: lat_range.0,
        east: lng_range.1,
        west: lng_range.0,
    })
}

/// The cell itself plus its 8 neighbours, computed by offsetting from the
/// cell centre by one cell span in each direction. Latitude clamps at the
/// poles; longitude wraps at the antimeridian. Deduplicated and sorted.
pub fn neighbours(hash: &str) -> Vec<String> {
    let Some(bounds) = decode_bounds(hash) else {
        return Vec::new();
    };
    let precision = hash.len();
    let lat_span = bounds.north - bounds.south;
    let lng_span = bounds.east - bounds.west;
    let centre_lat = (bounds.north + bounds.south) / 2.0;
    let centre_lng = (bounds.east + bounds.west) / 2.0;

    let mut out = BTreeSet::new();
    for dy in [-1.0, 0.0, 1.0] {
        for dx in [-1.0, 0.0, 1.0] {
            let lat = (centre_lat + dy * lat_span).clamp(-90.0, 90.0);
            let mut lng = centre_lng + dx * lng_span;
            if lng > 180.0 {
                lng -= 360.0;
            } else if lng < -180.0 {
                lng += 360.0;
            }
            out.insert(encode(lat, lng, precision));
        }
    }
    out.into_iter().collect()
}

/// Map zoom → geohash precision. Coarser than zoom 5 still gets precision 3.
pub fn precision_for_zoom(zoom: u8) -> usize {
    match zoom {
        0..=7 => 3,
        8..=10 => 4,
        11..=13 => 5,
        14..=16 => 6,
        _ => 7,
    }
}

/// Tile set covering a viewport: hash the four corners and the centre, then
/// union each with its neighbours so cells straddling the edges are included.
pub fn tiles_for_bounds(bounds: &BoundingBox, zoom: u8) -> Vec<String> {
    let precision = precision_for_zoom(zoom);
    let centre_lat = (bounds.north + bounds.south) / 2.0;
    let centre_lng = (bounds.east + bounds.west) / 2.0;
    let seeds = [
        (bounds.north, bounds.west),
        (bounds.north, bounds.east),
        (bounds.south, bounds.west),
        (bounds.south, bounds.east),
        (centre_lat, centre_lng),
    ];
    let mut out = BTreeSet::new();
    for (lat, lng) in seeds {
        let hash = encode(lat, lng, precision);
        for n in neighbours(&hash) {
            out.insert(n);
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(b: &BoundingBox, lat: f64, lng: f64) -> bool {
        lat >= b.south && lat <= b.north && lng >= b.west && lng <= b.east
    }

    #[test]
    fn encode_matches_known_hashes() {
        // Marrakech medina
        assert_eq!(encode(31.6295, -7.9811, 5), "evd7f");
        assert_eq!(encode(57.64911, 10.40744, 11), "u4pruydqqvj");
    }

    #[test]
    fn round_trip_bounds_contain_the_point() {
        let points = [
            (31.6295, -7.9811),
            (0.0, 0.0),
            (-89.9, 179.9),
            (89.9, -179.9),
            (-33.8688, 151.2093),
        ];
        for (lat, lng) in points {
            for precision in 1..=7 {
                let hash = encode(lat, lng, precision);
                let bounds = decode_bounds(&hash).unwrap();
                assert!(
                    contains(&bounds, lat, lng),
                    "({lat},{lng}) not inside bounds of {hash}"
                );
            }
        }
    }

    #[test]
    fn decode_rejects_invalid_input() {
        assert!(decode_bounds("").is_none());
        assert!(decode_bounds("ab!").is_none());
        // 'a', 'i', 'l', 'o' are not in the geohash alphabet
        assert!(decode_bounds("aaa").is_none());
    }

    #[test]
    fn neighbours_cover_the_surrounding_cells() {
        let ns = neighbours("evd7f");
        assert_eq!(ns.len(), 9);
        assert!(ns.contains(&"evd7f".to_string()));
        // Every neighbour touches the original cell
        let b = decode_bounds("evd7f").unwrap();
        for n in &ns {
            let nb = decode_bounds(n).unwrap();
            assert!(nb.west <= b.east + 1e-9 && nb.east >= b.west - 1e-9);
            assert!(nb.south <= b.north + 1e-9 && nb.north >= b.south - 1e-9);
        }
    }

    #[test]
    fn precision_table() {
        assert_eq!(precision_for_zoom(5), 3);
        assert_eq!(precision_for_zoom(7), 3);
        assert_eq!(precision_for_zoom(8), 4);
        assert_eq!(precision_for_zoom(10), 4);
        assert_eq!(precision_for_zoom(11), 5);
        assert_eq!(precision_for_zoom(13), 5);
        assert_eq!(precision_for_zoom(14), 6);
        assert_eq!(precision_for_zoom(16), 6);
        assert_eq!(precision_for_zoom(17), 7);
        assert_eq!(precision_for_zoom(21), 7);
    }

    #[test]
    fn viewport_tiles_cover_every_interior_point() {
        let viewport = BoundingBox {
            north: 31.66,
            south: 31.60,
            east: -7.95,
            west: -8.02,
        };
        for zoom in [6, 9, 12, 15] {
            let tiles = tiles_for_bounds(&viewport, zoom);
            assert!(!tiles.is_empty());
            let cells: Vec<BoundingBox> =
                tiles.iter().map(|t| decode_bounds(t).unwrap()).collect();
            // Sample a grid of interior points
            for i in 0..=10 {
                for j in 0..=10 {
                    let lat =
                        viewport.south + (viewport.north - viewport.south) * (i as f64 / 10.0);
                    let lng = viewport.west + (viewport.east - viewport.west) * (j as f64 / 10.0);
                    assert!(
                        cells.iter().any(|c| contains(c, lat, lng)),
                        "point ({lat},{lng}) uncovered at zoom {zoom}"
                    );
                }
            }
        }
    }
}
