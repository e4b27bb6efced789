use std::collections::HashSet;

use rand::Rng;

/// Gives up on distinctness after this many draws per colour.
const MAX_ATTEMPTS: usize = 64;

/// `count` distinct light colours as `#rrggbb`.
///
/// Light means a bright value with medium to full saturation, so the colours
/// stay readable on a dark logo background.
pub fn random_light_colors(count: usize, rng: &mut impl Rng) -> Vec<String> {
    let mut seen = HashSet::with_capacity(count);
    let mut colors = Vec::with_capacity(count);

    while colors.len() < count {
        let mut color = random_light_color(rng);
        for _ in 0..MAX_ATTEMPTS {
            if !seen.contains(&color) {
                break;
            }
            color = random_light_color(rng);
        }

        // Still taken, step through its neighbours.
        while seen.contains(&color) {
            color = nudge(color);
        }

        seen.insert(color);
        colors.push(to_hex(color));
    }

    colors
}

fn random_light_color(rng: &mut impl Rng) -> [u8; 3] {
    let hue = rng.random_range(0.0..360.0);
    let saturation = rng.random_range(0.55..=1.0);
    let value = rng.random_range(0.7..=1.0);
    hsv_to_rgb(hue, saturation, value)
}

fn nudge([r, g, b]: [u8; 3]) -> [u8; 3] {
    [r, g, b.wrapping_add(1)]
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [u8; 3] {
    let c = value * saturation;
    let h = (hue % 360.0) / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = value - c;

    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    let channel = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    [channel(r), channel(g), channel(b)]
}

fn to_hex([r, g, b]: [u8; 3]) -> String {
    format!("#{r:02x}{g:02x}{b:02x}")
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn test_distinct_and_light() {
        let mut rng = StdRng::seed_from_u64(7);
        let colors = random_light_colors(200, &mut rng);

        assert_eq!(colors.len(), 200);
        assert_eq!(colors.iter().collect::<HashSet<_>>().len(), 200);

        for color in &colors {
            assert_eq!(color.len(), 7);
            assert!(color.starts_with('#'));
            let max = (0..3)
                .map(|i| u8::from_str_radix(&color[1 + 2 * i..3 + 2 * i], 16).unwrap())
                .max()
                .unwrap();
            assert!(max >= 178, "{color} is too dark");
        }
    }

    #[test]
    fn test_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(random_light_colors(0, &mut rng).is_empty());
    }

    #[test]
    fn test_hsv_to_rgb() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [255, 0, 0]);
        assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), [0, 255, 0]);
        assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), [0, 0, 255]);
        assert_eq!(hsv_to_rgb(0.0, 0.0, 1.0), [255, 255, 255]);
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let a = random_light_colors(5, &mut StdRng::seed_from_u64(42));
        let b = random_light_colors(5, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
