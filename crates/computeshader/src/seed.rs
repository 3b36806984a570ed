//! Initial contents for storage buffers.
//!
//! Every recipe draws from a caller-supplied RNG so a given `--seed` always
//! produces the same bytes.

use std::f32::consts::TAU;

use rand::rngs::StdRng;
use rand::Rng;
use sceneconfig::{AgentPalette, BufferConfig, SeedConfig};

const AGENT_FLOATS: usize = 6;
const BODY_FLOATS: usize = 5;

const RAINBOW: [[f32; 3]; 7] = [
    [1.0, 0.0, 0.0],
    [1.0, 200.0 / 255.0, 0.0],
    [1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 1.0, 1.0],
    [0.0, 0.0, 1.0],
    [1.0, 0.0, 1.0],
];

/// Bytes for `buffer`, or `None` when it declares no seed.
///
/// `area` is the pixel rectangle agents and bodies are scattered over.
pub fn seed_buffer(buffer: &BufferConfig, area: [u32; 2], rng: &mut StdRng) -> Option<Vec<u8>> {
    let count = buffer.count as usize;
    let floats = match buffer.seed.as_ref()? {
        SeedConfig::Zeroed => return Some(vec![0; buffer.byte_len() as usize]),
        SeedConfig::Constant { values } => values.repeat(count),
        SeedConfig::Agents {
            palette,
            color,
            spread,
            area: seed_area,
        } => agents(
            count,
            seed_area.unwrap_or(area),
            *palette,
            color.unwrap_or([1.0, 1.0, 1.0]),
            *spread,
            rng,
        ),
        SeedConfig::Bodies {
            central_mass,
            area: seed_area,
        } => bodies(count, seed_area.unwrap_or(area), *central_mass, rng),
    };
    Some(bytemuck::cast_slice(&floats).to_vec())
}

/// `[x, y, heading_degrees, r, g, b]` per agent.
fn agents(
    count: usize,
    area: [u32; 2],
    palette: AgentPalette,
    solid: [f32; 3],
    spread: f32,
    rng: &mut StdRng,
) -> Vec<f32> {
    let width = area[0] as f32;
    let height = area[1] as f32;
    let centre = (width / 2.0, height / 2.0);
    let radius = width.min(height) / spread.max(f32::EPSILON);
    let base_hue: f32 = rng.gen();

    let mut out = Vec::with_capacity(count * AGENT_FLOATS);
    for index in 0..count {
        let t = index as f32 / count as f32;
        let (x, y) = match palette {
            AgentPalette::Random | AgentPalette::Solid => {
                (rng.gen::<f32>() * width, rng.gen::<f32>() * height)
            }
            _ => {
                let distance = radius * rng.gen::<f32>().sqrt();
                let theta = rng.gen::<f32>() * TAU;
                (
                    centre.0 + distance * theta.cos(),
                    centre.1 + distance * theta.sin(),
                )
            }
        };
        let heading = rng.gen::<f32>() * 360.0;
        let colour = match palette {
            AgentPalette::Hue => hsv_to_rgb(t, 1.0, 1.0),
            AgentPalette::Saturation => hsv_to_rgb(base_hue, t, 1.0),
            AgentPalette::Rainbow => RAINBOW[rng.gen_range(0..RAINBOW.len())],
            // Blue fading to red across the population.
            AgentPalette::Gradient => [t, 0.0, 1.0 - t],
            AgentPalette::Random => hsv_to_rgb(rng.gen(), 1.0, rng.gen()),
            AgentPalette::Solid => solid,
        };
        out.extend_from_slice(&[x, y, heading, colour[0], colour[1], colour[2]]);
    }
    out
}

/// `[x, y, vx, vy, mass]` per body; body 0 sits still at the centre.
fn bodies(count: usize, area: [u32; 2], central_mass: f32, rng: &mut StdRng) -> Vec<f32> {
    let width = area[0] as f32;
    let height = area[1] as f32;
    let mut out = Vec::with_capacity(count * BODY_FLOATS);
    if count == 0 {
        return out;
    }
    out.extend_from_slice(&[width / 2.0, height / 2.0, 0.0, 0.0, central_mass]);
    for _ in 1..count {
        out.extend_from_slice(&[
            rng.gen::<f32>() * width,
            rng.gen::<f32>() * height,
            (0.5 - rng.gen::<f32>()) * 400.0,
            (0.5 - rng.gen::<f32>()) * 400.0,
            rng.gen::<f32>() * 10.0,
        ]);
    }
    out
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [f32; 3] {
    let h = hue.rem_euclid(1.0) * 6.0;
    let sector = h.floor();
    let f = h - sector;
    let p = value * (1.0 - saturation);
    let q = value * (1.0 - saturation * f);
    let t = value * (1.0 - saturation * (1.0 - f));
    match sector as u32 {
        0 => [value, t, p],
        1 => [q, value, p],
        2 => [p, value, t],
        3 => [p, q, value],
        4 => [t, p, value],
        _ => [value, p, q],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use sceneconfig::{AGENT_STRIDE, BODY_STRIDE};

    fn buffer(stride: u32, count: u32, seed: SeedConfig) -> BufferConfig {
        BufferConfig {
            stride,
            count,
            seed: Some(seed),
        }
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect()
    }

    fn agent_seed(palette: AgentPalette) -> SeedConfig {
        SeedConfig::Agents {
            palette,
            color: None,
            spread: 4.0,
            area: None,
        }
    }

    #[test]
    fn unseeded_buffers_yield_nothing() {
        let config = BufferConfig {
            stride: 16,
            count: 4,
            seed: None,
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert!(seed_buffer(&config, [64, 64], &mut rng).is_none());
    }

    #[test]
    fn zeroed_and_constant_fill_the_whole_buffer() {
        let mut rng = StdRng::seed_from_u64(0);
        let zeroed = seed_buffer(&buffer(16, 8, SeedConfig::Zeroed), [1, 1], &mut rng).unwrap();
        assert_eq!(zeroed, vec![0u8; 128]);

        let constant = SeedConfig::Constant {
            values: vec![1.0, 2.0],
        };
        let bytes = seed_buffer(&buffer(8, 3, constant), [1, 1], &mut rng).unwrap();
        assert_eq!(floats(&bytes), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn agents_start_inside_the_central_disc() {
        let mut rng = StdRng::seed_from_u64(11);
        let config = buffer(AGENT_STRIDE, 500, agent_seed(AgentPalette::Hue));
        let values = floats(&seed_buffer(&config, [400, 200], &mut rng).unwrap());
        assert_eq!(values.len(), 500 * AGENT_FLOATS);

        // Radius is min(w, h) / spread = 50.
        for agent in values.chunks_exact(AGENT_FLOATS) {
            let dx = agent[0] - 200.0;
            let dy = agent[1] - 100.0;
            assert!((dx * dx + dy * dy).sqrt() <= 50.0 + 1e-3);
            assert!((0.0..360.0).contains(&agent[2]));
            for channel in &agent[3..] {
                assert!((0.0..=1.0).contains(channel));
            }
        }
    }

    #[test]
    fn scattered_palettes_cover_the_area() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = buffer(AGENT_STRIDE, 200, agent_seed(AgentPalette::Random));
        let values = floats(&seed_buffer(&config, [320, 240], &mut rng).unwrap());
        for agent in values.chunks_exact(AGENT_FLOATS) {
            assert!((0.0..320.0).contains(&agent[0]));
            assert!((0.0..240.0).contains(&agent[1]));
        }
    }

    #[test]
    fn rainbow_agents_use_palette_colours() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = buffer(AGENT_STRIDE, 100, agent_seed(AgentPalette::Rainbow));
        let values = floats(&seed_buffer(&config, [100, 100], &mut rng).unwrap());
        for agent in values.chunks_exact(AGENT_FLOATS) {
            let colour = [agent[3], agent[4], agent[5]];
            assert!(RAINBOW.contains(&colour));
        }
    }

    #[test]
    fn solid_agents_take_the_configured_colour() {
        let mut rng = StdRng::seed_from_u64(5);
        let seed = SeedConfig::Agents {
            palette: AgentPalette::Solid,
            color: Some([0.25, 0.5, 0.75]),
            spread: 256.0,
            area: Some([10, 10]),
        };
        let values = floats(&seed_buffer(&buffer(AGENT_STRIDE, 10, seed), [999, 999], &mut rng).unwrap());
        for agent in values.chunks_exact(AGENT_FLOATS) {
            assert_eq!(&agent[3..], &[0.25, 0.5, 0.75]);
            assert!(agent[0] < 10.0 && agent[1] < 10.0);
        }
    }

    #[test]
    fn bodies_orbit_a_heavy_centre() {
        let mut rng = StdRng::seed_from_u64(42);
        let seed = SeedConfig::Bodies {
            central_mass: 10_000.0,
            area: None,
        };
        let values = floats(&seed_buffer(&buffer(BODY_STRIDE, 64, seed), [800, 600], &mut rng).unwrap());
        assert_eq!(values.len(), 64 * BODY_FLOATS);
        assert_eq!(&values[..BODY_FLOATS], &[400.0, 300.0, 0.0, 0.0, 10_000.0]);

        for body in values.chunks_exact(BODY_FLOATS).skip(1) {
            assert!((0.0..800.0).contains(&body[0]));
            assert!((0.0..600.0).contains(&body[1]));
            assert!(body[2].abs() <= 200.0 && body[3].abs() <= 200.0);
            assert!((0.0..10.0).contains(&body[4]));
        }
    }

    #[test]
    fn same_seed_same_bytes() {
        let config = buffer(AGENT_STRIDE, 32, agent_seed(AgentPalette::Saturation));
        let first = seed_buffer(&config, [64, 64], &mut StdRng::seed_from_u64(9)).unwrap();
        let again = seed_buffer(&config, [64, 64], &mut StdRng::seed_from_u64(9)).unwrap();
        let other = seed_buffer(&config, [64, 64], &mut StdRng::seed_from_u64(10)).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [1.0, 0.0, 0.0]);
        assert_eq!(hsv_to_rgb(1.0 / 3.0, 1.0, 1.0)[1], 1.0);
        assert_eq!(hsv_to_rgb(0.5, 0.0, 0.5), [0.5, 0.5, 0.5]);
    }
}
