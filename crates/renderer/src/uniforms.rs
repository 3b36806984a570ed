use tracing::trace;

use crate::compile::{ScalarType, UniformBlock, UniformType};
use crate::params::{ParamValue, ParamView};

/// Fills a uniform block from parameters matched by member name.
///
/// Members without a parameter stay zero, and parameters the block does not
/// declare are ignored. Numeric kinds are converted to the member's scalar
/// type; a component-count mismatch leaves the member untouched.
pub fn pack_block(block: &UniformBlock, params: &ParamView<'_>) -> Vec<u8> {
    let mut bytes = vec![0u8; block.size as usize];
    for member in &block.members {
        let Some(value) = params.get(&member.name) else {
            continue;
        };
        let Some(encoded) = encode(member.ty, &value) else {
            trace!(member = %member.name, ?value, ty = ?member.ty, "parameter does not fit uniform member");
            continue;
        };
        let start = member.offset as usize;
        let end = start + encoded.len();
        if end <= bytes.len() {
            bytes[start..end].copy_from_slice(&encoded);
        }
    }
    bytes
}

fn encode(ty: UniformType, value: &ParamValue) -> Option<Vec<u8>> {
    let components = value.components();
    match ty {
        UniformType::Scalar(scalar) => {
            if components.len() != 1 {
                return None;
            }
            encode_scalar(scalar, components[0]).map(|bytes| bytes.to_vec())
        }
        UniformType::Vector(size, scalar) => {
            if components.len() != size as usize {
                return None;
            }
            let mut out = Vec::with_capacity(components.len() * 4);
            for component in components {
                out.extend_from_slice(&encode_scalar(scalar, component)?);
            }
            Some(out)
        }
        UniformType::Matrix { columns, rows } => {
            if components.len() != usize::from(columns) * usize::from(rows) {
                return None;
            }
            // Columns of vec3/vec4 are 16-byte aligned, vec2 columns 8.
            let stride = if rows == 2 { 8 } else { 16 };
            let mut out = vec![0u8; stride * usize::from(columns)];
            for (index, component) in components.iter().enumerate() {
                let column = index / usize::from(rows);
                let row = index % usize::from(rows);
                let at = column * stride + row * 4;
                out[at..at + 4].copy_from_slice(&encode_scalar(ScalarType::Float, *component)?);
            }
            Some(out)
        }
        UniformType::Unsupported => None,
    }
}

fn encode_scalar(scalar: ScalarType, value: f64) -> Option<[u8; 4]> {
    match scalar {
        ScalarType::Float => Some(bytemuck::cast(value as f32)),
        ScalarType::Sint => Some(bytemuck::cast(value as i32)),
        ScalarType::Uint => {
            if value < 0.0 {
                None
            } else {
                Some(bytemuck::cast(value as u32))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::UniformMember;
    use crate::params::{ParamSnapshot, ParameterStore};

    fn block() -> UniformBlock {
        UniformBlock {
            group: 0,
            binding: 2,
            size: 96,
            members: vec![
                UniformMember {
                    name: "Time".into(),
                    offset: 0,
                    ty: UniformType::Scalar(ScalarType::Float),
                },
                UniformMember {
                    name: "Stage".into(),
                    offset: 4,
                    ty: UniformType::Scalar(ScalarType::Uint),
                },
                UniformMember {
                    name: "Tint".into(),
                    offset: 16,
                    ty: UniformType::Vector(4, ScalarType::Float),
                },
                UniformMember {
                    name: "View".into(),
                    offset: 32,
                    ty: UniformType::Matrix {
                        columns: 4,
                        rows: 4,
                    },
                },
            ],
        }
    }

    fn read_f32(bytes: &[u8], offset: usize) -> f32 {
        bytemuck::pod_read_unaligned(&bytes[offset..offset + 4])
    }

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        bytemuck::pod_read_unaligned(&bytes[offset..offset + 4])
    }

    #[test]
    fn packs_members_by_name() {
        let store = ParameterStore::new();
        store.set("Tint", ParamValue::Color([0.1, 0.2, 0.3, 1.0])).unwrap();
        store.set("Unused", ParamValue::Float(42.0)).unwrap();
        let snapshot = store.snapshot();
        let overrides = vec![("Stage".to_string(), ParamValue::Int(1))];
        let builtins = [("Time", ParamValue::Float(2.5))];
        let view = ParamView {
            overrides: &overrides,
            snapshot: &snapshot,
            builtins: &builtins,
        };
        let bytes = pack_block(&block(), &view);
        assert_eq!(bytes.len(), 96);
        assert_eq!(read_f32(&bytes, 0), 2.5);
        assert_eq!(read_u32(&bytes, 4), 1);
        assert_eq!(read_f32(&bytes, 16), 0.1);
        assert_eq!(read_f32(&bytes, 28), 1.0);
    }

    #[test]
    fn matrices_are_column_major() {
        let mut m = [[0.0f32; 4]; 4];
        m[3][0] = 7.0;
        let overrides = vec![("View".to_string(), ParamValue::Mat4(m))];
        let snapshot = ParamSnapshot::default();
        let view = ParamView {
            overrides: &overrides,
            snapshot: &snapshot,
            builtins: &[],
        };
        let bytes = pack_block(&block(), &view);
        assert_eq!(read_f32(&bytes, 32 + 48), 7.0);
    }

    #[test]
    fn mismatched_values_leave_member_zeroed() {
        let overrides = vec![
            ("Tint".to_string(), ParamValue::Vec2([1.0, 1.0])),
            ("Stage".to_string(), ParamValue::Int(-1)),
        ];
        let snapshot = ParamSnapshot::default();
        let view = ParamView {
            overrides: &overrides,
            snapshot: &snapshot,
            builtins: &[],
        };
        let bytes = pack_block(&block(), &view);
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
