//! Readers for the per-scan annotation sources. None of them cross-reference
//! another source; joining happens in [`crate::fusion`].

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;

use hashbrown::HashMap as FastMap;
use log::debug;
use nohash_hasher::BuildNoHashHasher;
use ply_rs::{parser, ply};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{PrepError, Result};
use crate::fusion::AxisAlignment;

/// Mesh vertices in file order. Colors stay in the 0..=255 range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexBuffer {
    pub positions: Vec<[f32; 3]>,
    pub colors: Option<Vec<[f32; 3]>>,
}

impl VertexBuffer {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Segment id -> vertex indices, ascending.
pub type SegmentMap = FastMap<u32, Vec<u32>, BuildNoHashHasher<u32>>;

/// 1-based object id -> segment ids.
pub type ObjectToSegs = BTreeMap<u32, Vec<u32>>;

/// Raw label name -> segment ids of every object carrying it.
pub type LabelToSegs = BTreeMap<String, Vec<u32>>;

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| PrepError::io(path, e))
}

/// ply_rs reports malformed input through the io error kind.
fn mesh_error(mesh_file: &Path, e: io::Error) -> PrepError {
    match e.kind() {
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
            PrepError::format(mesh_file, e.to_string())
        }
        _ => PrepError::io(mesh_file, e),
    }
}

fn scalar(p: &ply::Property) -> Option<f32> {
    Some(match *p {
        ply::Property::Char(v) => v as f32,
        ply::Property::UChar(v) => v as f32,
        ply::Property::Short(v) => v as f32,
        ply::Property::UShort(v) => v as f32,
        ply::Property::Int(v) => v as f32,
        ply::Property::UInt(v) => v as f32,
        ply::Property::Float(v) => v,
        ply::Property::Double(v) => v as f32,
        _ => return None,
    })
}

fn read_mesh(mesh_file: &Path, with_color: bool) -> Result<VertexBuffer> {
    let file = File::open(mesh_file).map_err(|e| PrepError::io(mesh_file, e))?;
    let file_len = file.metadata().map_err(|e| PrepError::io(mesh_file, e))?.len();
    let mut rd = BufReader::new(file);

    let vertex_parser = parser::Parser::<ply::DefaultElement>::new();
    let header = vertex_parser
        .read_header(&mut rd)
        .map_err(|e| mesh_error(mesh_file, e))?;

    let declared = header
        .elements
        .get("vertex")
        .map(|element| element.count)
        .ok_or_else(|| PrepError::format(mesh_file, "no 'vertex' element"))?;

    // Every vertex takes at least one byte in any encoding.
    if declared as u64 > file_len {
        return Err(PrepError::format(
            mesh_file,
            format!("header declares {} vertices in a {} byte file", declared, file_len),
        ));
    }

    let payload = vertex_parser
        .read_payload(&mut rd, &header)
        .map_err(|e| mesh_error(mesh_file, e))?;
    let verts = payload
        .get("vertex")
        .ok_or_else(|| PrepError::format(mesh_file, "no 'vertex' element"))?;

    let field = |i: usize, rec: &ply::DefaultElement, name: &str| {
        rec.get(name)
            .and_then(scalar)
            .ok_or_else(|| PrepError::format(mesh_file, format!("vertex {}: no scalar '{}'", i, name)))
    };

    let mut positions = Vec::with_capacity(verts.len());
    let mut colors = with_color.then(|| Vec::with_capacity(verts.len()));

    for (i, rec) in verts.iter().enumerate() {
        positions.push([field(i, rec, "x")?, field(i, rec, "y")?, field(i, rec, "z")?]);
        if let Some(colors) = colors.as_mut() {
            colors.push([
                field(i, rec, "red")?,
                field(i, rec, "green")?,
                field(i, rec, "blue")?,
            ]);
        }
    }

    debug!("{}: {} vertices", mesh_file.display(), positions.len());

    Ok(VertexBuffer { positions, colors })
}

/// Positions and colors of every mesh vertex.
pub fn read_vertices(mesh_file: &Path) -> Result<VertexBuffer> {
    read_mesh(mesh_file, true)
}

/// Positions only; for meshes without color channels.
pub fn read_vertices_xyz(mesh_file: &Path) -> Result<VertexBuffer> {
    read_mesh(mesh_file, false)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    serde_json::from_reader(open(path)?).map_err(|e| {
        if e.is_io() {
            PrepError::io(path, e.into())
        } else {
            PrepError::format(path, e.to_string())
        }
    })
}

#[derive(Deserialize)]
struct SegmentationFile {
    #[serde(rename = "segIndices")]
    seg_indices: Vec<u32>,
}

/// Group vertices by segment id. Returns the map and the vertex count.
pub fn read_segmentation(seg_file: &Path) -> Result<(SegmentMap, usize)> {
    let file: SegmentationFile = read_json(seg_file)?;

    if file.seg_indices.is_empty() {
        return Err(PrepError::format(seg_file, "segIndices is empty"));
    }

    let mut segments = SegmentMap::default();
    for (vertex, &seg) in file.seg_indices.iter().enumerate() {
        segments.entry(seg).or_default().push(vertex as u32);
    }

    debug!(
        "{}: {} segments over {} vertices",
        seg_file.display(),
        segments.len(),
        file.seg_indices.len()
    );

    Ok((segments, file.seg_indices.len()))
}

#[derive(Deserialize)]
struct AggregationFile {
    #[serde(rename = "segGroups")]
    seg_groups: Vec<SegGroup>,
}

#[derive(Deserialize)]
struct SegGroup {
    #[serde(rename = "objectId")]
    object_id: u32,
    label: String,
    segments: Vec<u32>,
}

/// Object and label groupings; object ids become 1-based.
pub fn read_aggregation(agg_file: &Path) -> Result<(ObjectToSegs, LabelToSegs)> {
    let file: AggregationFile = read_json(agg_file)?;

    let mut object_to_segs = ObjectToSegs::new();
    let mut label_to_segs = LabelToSegs::new();

    for group in file.seg_groups {
        let object_id = group.object_id.checked_add(1).ok_or_else(|| {
            PrepError::format(agg_file, format!("objectId {} out of range", group.object_id))
        })?;
        label_to_segs
            .entry(group.label)
            .or_default()
            .extend_from_slice(&group.segments);
        object_to_segs.insert(object_id, group.segments);
    }

    Ok((object_to_segs, label_to_segs))
}

/// Label vocabulary keyed by raw name, or by integer when the key column is numeric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelTable {
    ByName(HashMap<String, u32>),
    ById(HashMap<u32, u32>),
}

impl LabelTable {
    pub fn resolve(&self, label: &str) -> Option<u32> {
        match self {
            LabelTable::ByName(map) => map.get(label).copied(),
            LabelTable::ById(map) => label
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|k| map.get(&k).copied()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LabelTable::ByName(map) => map.len(),
            LabelTable::ById(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tab-separated table with a header row; maps `from_col` to the integer in `to_col`.
pub fn read_label_table(label_map_file: &Path, from_col: &str, to_col: &str) -> Result<LabelTable> {
    let text = fs::read_to_string(label_map_file).map_err(|e| PrepError::io(label_map_file, e))?;
    let mut lines = text.lines();

    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| PrepError::format(label_map_file, "empty label table"))?
        .split('\t')
        .map(str::trim)
        .collect();

    let column = |name: &str| {
        header
            .iter()
            .position(|h| *h == name)
            .ok_or_else(|| PrepError::format(label_map_file, format!("missing column '{}'", name)))
    };
    let from = column(from_col)?;
    let to = column(to_col)?;

    let mut rows = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        let key = fields.get(from).copied().unwrap_or("");
        let value = fields
            .get(to)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                PrepError::format(
                    label_map_file,
                    format!("line {}: no integer in column '{}'", line_no + 2, to_col),
                )
            })?;

        rows.push((key, value));
    }

    // The first key decides how the whole column is interpreted.
    let numeric = rows
        .first()
        .map(|(k, _)| k.trim().parse::<u32>().is_ok())
        .unwrap_or(false);

    let table = if numeric {
        let mut map = HashMap::with_capacity(rows.len());
        for (key, value) in rows {
            let id = key.trim().parse::<u32>().map_err(|_| {
                PrepError::format(label_map_file, format!("non-numeric key '{}'", key))
            })?;
            map.insert(id, value);
        }
        LabelTable::ById(map)
    } else {
        LabelTable::ByName(rows.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
    };

    debug!("{}: {} labels", label_map_file.display(), table.len());

    Ok(table)
}

/// Alignment matrix from a scan's metadata text file.
pub fn read_axis_alignment(meta_file: &Path) -> Result<AxisAlignment> {
    let text = fs::read_to_string(meta_file).map_err(|e| PrepError::io(meta_file, e))?;
    AxisAlignment::parse_metadata(&text).map_err(|reason| PrepError::format(meta_file, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const TABLE: &str = "id\traw_category\tcategory\tcount\tnyu40id\tnyu40class\n\
1\twall\twall\t8277\t1\twall\n\
2\tchair\tchair\t4646\t5\tchair\n\
22\tbooks\tbook\t1678\t23\tbooks\n";

    #[test]
    fn segmentation_groups_vertices_by_segment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.segs.json");
        fs::write(&path, r#"{"sceneId": "x", "segIndices": [7, 7, 3, 7, 3]}"#).unwrap();

        let (segments, count) = read_segmentation(&path).unwrap();

        assert_eq!(count, 5);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[&7], vec![0, 1, 3]);
        assert_eq!(segments[&3], vec![2, 4]);
    }

    #[test]
    fn empty_or_malformed_segmentation_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.json");
        let wrong = dir.path().join("wrong.json");
        fs::write(&empty, r#"{"segIndices": []}"#).unwrap();
        fs::write(&wrong, r#"{"indices": [1, 2]}"#).unwrap();

        assert!(matches!(read_segmentation(&empty), Err(PrepError::Format { .. })));
        assert!(matches!(read_segmentation(&wrong), Err(PrepError::Format { .. })));
        assert!(matches!(
            read_segmentation(&dir.path().join("absent.json")),
            Err(PrepError::Io { .. })
        ));
    }

    #[test]
    fn aggregation_shifts_ids_and_concatenates_labels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.aggregation.json");
        fs::write(
            &path,
            r#"{"segGroups": [
                {"id": 0, "objectId": 0, "label": "chair", "segments": [4, 5]},
                {"id": 1, "objectId": 1, "label": "wall", "segments": [1]},
                {"id": 2, "objectId": 2, "label": "chair", "segments": [5, 9]}
            ]}"#,
        )
        .unwrap();

        let (objects, labels) = read_aggregation(&path).unwrap();

        assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(objects[&1], vec![4, 5]);
        assert_eq!(labels["chair"], vec![4, 5, 5, 9]);
        assert_eq!(labels["wall"], vec![1]);
    }

    #[test]
    fn aggregation_without_seg_groups_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json");
        fs::write(&path, r#"{"groups": []}"#).unwrap();

        assert!(matches!(read_aggregation(&path), Err(PrepError::Format { .. })));
    }

    #[test]
    fn label_table_by_name_and_by_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.tsv");
        fs::write(&path, TABLE).unwrap();

        let by_name = read_label_table(&path, "raw_category", "nyu40id").unwrap();
        assert!(matches!(by_name, LabelTable::ByName(_)));
        assert_eq!(by_name.resolve("chair"), Some(5));
        assert_eq!(by_name.resolve("books"), Some(23));
        assert_eq!(by_name.resolve("lamp"), None);

        let by_id = read_label_table(&path, "id", "nyu40id").unwrap();
        assert!(matches!(by_id, LabelTable::ById(_)));
        assert_eq!(by_id.resolve("22"), Some(23));
        assert_eq!(by_id.resolve("chair"), None);
    }

    #[test]
    fn label_table_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.tsv");
        fs::write(&path, TABLE).unwrap();

        let err = read_label_table(&path, "raw_category", "eigen13id").unwrap_err();
        assert!(matches!(err, PrepError::Format { reason, .. } if reason.contains("eigen13id")));

        let err = read_label_table(&dir.path().join("none.tsv"), "raw_category", "nyu40id").unwrap_err();
        assert!(matches!(err, PrepError::Io { .. }));
    }

    #[test]
    fn axis_alignment_from_metadata_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.txt");
        fs::write(
            &path,
            "colorHeight = 968\naxisAlignment = 1 0 0 2 0 1 0 3 0 0 1 4 0 0 0 1 \nsceneType = Office\n",
        )
        .unwrap();

        let m = read_axis_alignment(&path).unwrap();
        assert_eq!(m.apply([0.0, 0.0, 0.0]), [2.0, 3.0, 4.0]);

        fs::write(&path, "colorHeight = 968\n").unwrap();
        assert!(matches!(read_axis_alignment(&path), Err(PrepError::Format { .. })));
    }

    #[test]
    fn vertices_with_and_without_color() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.ply");
        fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 2\nproperty float x\nproperty float y\n\
             property float z\nproperty uchar red\nproperty uchar green\nproperty uchar blue\n\
             property uchar alpha\nend_header\n1 2 3 10 20 30 255\n4 5 6 40 50 60 255\n",
        )
        .unwrap();

        let colored = read_vertices(&path).unwrap();
        assert_eq!(colored.len(), 2);
        assert_eq!(colored.positions[1], [4.0, 5.0, 6.0]);
        assert_eq!(colored.colors.as_ref().unwrap()[0], [10.0, 20.0, 30.0]);

        let plain = read_vertices_xyz(&path).unwrap();
        assert_eq!(plain.positions, colored.positions);
        assert!(plain.colors.is_none());
    }

    #[test]
    fn binary_mesh_with_double_positions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.ply");
        let mut bytes = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\n\
property double x\nproperty double y\nproperty double z\n\
property uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n"
            .to_vec();
        for v in [1.5f64, -2.0, 3.25] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&[7, 8, 9]);
        fs::write(&path, bytes).unwrap();

        let mesh = read_vertices(&path).unwrap();
        assert_eq!(mesh.positions, vec![[1.5, -2.0, 3.25]]);
        assert_eq!(mesh.colors, Some(vec![[7.0, 8.0, 9.0]]));
    }

    #[test]
    fn implausible_vertex_count_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.ply");
        fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 4611686018427387904\nproperty float x\n\
             property float y\nproperty float z\nend_header\n0 0 0\n",
        )
        .unwrap();

        let err = read_vertices_xyz(&path).unwrap_err();
        assert!(matches!(err, PrepError::Format { reason, .. } if reason.contains("4611686018427387904")));
    }

    #[test]
    fn mesh_without_colors_or_vertices_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.ply");
        fs::write(
            &plain,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\n\
             property float z\nend_header\n1 2 3\n",
        )
        .unwrap();
        let err = read_vertices(&plain).unwrap_err();
        assert!(matches!(err, PrepError::Format { reason, .. } if reason.contains("red")));
        assert_eq!(read_vertices_xyz(&plain).unwrap().positions, vec![[1.0, 2.0, 3.0]]);

        let faces = dir.path().join("faces.ply");
        fs::write(
            &faces,
            "ply\nformat ascii 1.0\nelement face 0\nproperty list uchar int vertex_indices\nend_header\n",
        )
        .unwrap();
        assert!(matches!(read_vertices_xyz(&faces), Err(PrepError::Format { .. })));

        let garbage = dir.path().join("garbage.ply");
        fs::write(&garbage, "not a mesh\n").unwrap();
        assert!(matches!(read_vertices_xyz(&garbage), Err(PrepError::Format { .. })));
    }

    #[test]
    fn object_id_at_u32_max_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.aggregation.json");
        fs::write(
            &path,
            r#"{"segGroups": [{"objectId": 4294967295, "label": "chair", "segments": [0]}]}"#,
        )
        .unwrap();

        let err = read_aggregation(&path).unwrap_err();
        assert!(matches!(err, PrepError::Format { reason, .. } if reason.contains("4294967295")));
    }

    #[test]
    fn missing_mesh_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let err = read_vertices(&dir.path().join("nope.ply")).unwrap_err();
        assert!(matches!(err, PrepError::Io { .. }));
    }
}
