//! Alignment and label fusion.
//!
//! Joins the vertex buffer, segment map and object aggregation into one
//! per-vertex `(semantic_label, instance_id)` assignment, realigns positions
//! and derives an axis-aligned box per instance.
//!
//! Label order is deterministic: `label_to_segs` is walked by label name and a
//! vertex claimed by several labels keeps the last one. `object_to_segs` is
//! walked by object id.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{PrepError, Result};
use crate::readers::{LabelTable, LabelToSegs, ObjectToSegs, SegmentMap, VertexBuffer};

/// Row-major 4x4 affine transform applied as `(p, 1) · M^T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisAlignment {
    pub matrix: [[f64; 4]; 4],
}

impl AxisAlignment {
    pub const MARKER: &'static str = "axisAlignment";

    pub fn identity() -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self { matrix }
    }

    pub fn from_row_major(values: [f64; 16]) -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for (i, v) in values.into_iter().enumerate() {
            matrix[i / 4][i % 4] = v;
        }
        Self { matrix }
    }

    /// Parse the first `axisAlignment = m00 m01 ... m33` line of a metadata file.
    pub fn parse_metadata(text: &str) -> std::result::Result<Self, String> {
        let line = text
            .lines()
            .find(|l| l.contains(Self::MARKER))
            .ok_or_else(|| format!("no '{}' line", Self::MARKER))?;

        let rest = line.split_once('=').map(|(_, r)| r).unwrap_or_else(|| {
            let at = line.find(Self::MARKER).unwrap_or(0) + Self::MARKER.len();
            &line[at..]
        });

        let values = rest
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("bad {} value: {}", Self::MARKER, e))?;

        let values: [f64; 16] = values.try_into().map_err(|v: Vec<f64>| {
            format!("{} needs 16 values, found {}", Self::MARKER, v.len())
        })?;

        Ok(Self::from_row_major(values))
    }

    #[inline]
    pub fn apply(&self, p: [f32; 3]) -> [f32; 3] {
        let h = [p[0] as f64, p[1] as f64, p[2] as f64, 1.0];
        let mut out = [0.0f32; 3];
        for (o, row) in out.iter_mut().zip(&self.matrix) {
            *o = (row[0] * h[0] + row[1] * h[1] + row[2] * h[2] + row[3] * h[3]) as f32;
        }
        out
    }
}

/// Axis-aligned box of one instance plus its raw semantic class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceBox {
    pub center: [f32; 3],
    pub extent: [f32; 3],
    pub label: u32,
}

impl InstanceBox {
    /// Placeholder for an instance without vertices; keeps 1-based slots stable.
    pub const ZERO: InstanceBox = InstanceBox {
        center: [0.0; 3],
        extent: [0.0; 3],
        label: 0,
    };

    pub fn from_bounds(min: [f32; 3], max: [f32; 3], label: u32) -> Self {
        let mut center = [0.0; 3];
        let mut extent = [0.0; 3];
        for k in 0..3 {
            center[k] = (min[k] + max[k]) / 2.0;
            extent[k] = max[k] - min[k];
        }
        Self {
            center,
            extent,
            label,
        }
    }

    /// `[cx, cy, cz, dx, dy, dz, label]`
    pub fn to_array(&self) -> [f32; 7] {
        let [cx, cy, cz] = self.center;
        let [dx, dy, dz] = self.extent;
        [cx, cy, cz, dx, dy, dz, self.label as f32]
    }
}

/// Per-vertex assignment of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedScan {
    pub positions: Vec<[f32; 3]>,
    pub colors: Option<Vec<[f32; 3]>>,
    /// Raw class id, 0 where no label claims the vertex.
    pub semantic_labels: Vec<u32>,
    /// 1-based object id, 0 for background.
    pub instance_ids: Vec<u32>,
    /// Slot `i` belongs to object `i + 1`.
    pub instance_boxes: Vec<InstanceBox>,
    pub instance_to_semantic: BTreeMap<u32, u32>,
}

impl FusedScan {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn segment_vertices<'a>(segments: &'a SegmentMap, seg: u32, vertex_count: usize) -> Result<&'a [u32]> {
    let verts = segments
        .get(&seg)
        .ok_or_else(|| PrepError::lookup(format!("segment {} not in segmentation", seg)))?;

    if let Some(&v) = verts.iter().find(|&&v| v as usize >= vertex_count) {
        return Err(PrepError::lookup(format!(
            "segment {} references vertex {} of {}",
            seg, v, vertex_count
        )));
    }

    Ok(verts.as_slice())
}

pub fn fuse(
    vertices: VertexBuffer,
    segments: &SegmentMap,
    object_to_segs: &ObjectToSegs,
    label_to_segs: &LabelToSegs,
    label_table: &LabelTable,
    alignment: &AxisAlignment,
) -> Result<FusedScan> {
    let VertexBuffer { positions, colors } = vertices;
    let n = positions.len();

    // One box slot per id up to the largest; ids past this bound are corrupt.
    let num_instances = object_to_segs.keys().next_back().copied().unwrap_or(0) as usize;
    let max_instances = n.max(object_to_segs.len());
    if num_instances > max_instances {
        return Err(PrepError::lookup(format!(
            "object id {} exceeds {} vertices and {} objects",
            num_instances,
            n,
            object_to_segs.len()
        )));
    }

    let positions: Vec<[f32; 3]> = positions.into_iter().map(|p| alignment.apply(p)).collect();

    let mut semantic_labels = vec![0u32; n];
    let mut instance_ids = vec![0u32; n];

    for (label, segs) in label_to_segs {
        let class_id = label_table
            .resolve(label)
            .ok_or_else(|| PrepError::lookup(format!("label '{}' not in label table", label)))?;

        for &seg in segs {
            for &v in segment_vertices(segments, seg, n)? {
                semantic_labels[v as usize] = class_id;
            }
        }
    }

    let mut instance_to_semantic = BTreeMap::new();
    for (&object_id, segs) in object_to_segs {
        for &seg in segs {
            let verts = segment_vertices(segments, seg, n)?;
            for &v in verts {
                instance_ids[v as usize] = object_id;
            }
            if let Some(&first) = verts.first() {
                instance_to_semantic
                    .entry(object_id)
                    .or_insert(semantic_labels[first as usize]);
            }
        }
    }

    let mut bounds: Vec<Option<([f32; 3], [f32; 3])>> = vec![None; num_instances];

    for (p, &id) in positions.iter().zip(&instance_ids) {
        if id == 0 {
            continue;
        }
        let slot = &mut bounds[id as usize - 1];
        match slot {
            Some((min, max)) => {
                for k in 0..3 {
                    min[k] = min[k].min(p[k]);
                    max[k] = max[k].max(p[k]);
                }
            }
            None => *slot = Some((*p, *p)),
        }
    }

    let instance_boxes: Vec<InstanceBox> = bounds
        .into_iter()
        .enumerate()
        .map(|(i, b)| match b {
            Some((min, max)) => {
                let label = instance_to_semantic.get(&(i as u32 + 1)).copied().unwrap_or(0);
                InstanceBox::from_bounds(min, max, label)
            }
            None => InstanceBox::ZERO,
        })
        .collect();

    debug!(
        "fused {} vertices, {} labels, {} instances",
        n,
        label_to_segs.len(),
        num_instances
    );

    Ok(FusedScan {
        positions,
        colors,
        semantic_labels,
        instance_ids,
        instance_boxes,
        instance_to_semantic,
    })
}
