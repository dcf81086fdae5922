//! Class vocabulary: the evaluated NYU40 subset, its palette and the dense remap.

/// Raw NYU40 ids kept in the dense label space, in dense-index order.
pub const VALID_CLASS_IDS: [u32; 20] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 14, 16, 24, 28, 33, 34, 36, 39,
];

/// Names of [`VALID_CLASS_IDS`], index-aligned.
pub const CLASS_LABELS: [&str; 20] = [
    "wall",
    "floor",
    "cabinet",
    "bed",
    "chair",
    "sofa",
    "table",
    "door",
    "window",
    "bookshelf",
    "picture",
    "counter",
    "desk",
    "curtain",
    "refrigerator",
    "shower curtain",
    "toilet",
    "sink",
    "bathtub",
    "otherfurniture",
];

/// Dense label written for points outside the valid set.
pub const IGNORE_LABEL: i32 = -100;

/// Per raw class id, RGB in 0..=255. Ids 13 and 31 have no entry.
pub const SCANNET_COLOR_MAP: [(u32, [f32; 3]); 39] = [
    (0, [0.0, 0.0, 0.0]),
    (1, [174.0, 199.0, 232.0]),
    (2, [152.0, 223.0, 138.0]),
    (3, [31.0, 119.0, 180.0]),
    (4, [255.0, 187.0, 120.0]),
    (5, [188.0, 189.0, 34.0]),
    (6, [140.0, 86.0, 75.0]),
    (7, [255.0, 152.0, 150.0]),
    (8, [214.0, 39.0, 40.0]),
    (9, [197.0, 176.0, 213.0]),
    (10, [148.0, 103.0, 189.0]),
    (11, [196.0, 156.0, 148.0]),
    (12, [23.0, 190.0, 207.0]),
    (14, [247.0, 182.0, 210.0]),
    (15, [66.0, 188.0, 102.0]),
    (16, [219.0, 219.0, 141.0]),
    (17, [140.0, 57.0, 197.0]),
    (18, [202.0, 185.0, 52.0]),
    (19, [51.0, 176.0, 203.0]),
    (20, [200.0, 54.0, 131.0]),
    (21, [92.0, 193.0, 61.0]),
    (22, [78.0, 71.0, 183.0]),
    (23, [172.0, 114.0, 82.0]),
    (24, [255.0, 127.0, 14.0]),
    (25, [91.0, 163.0, 138.0]),
    (26, [153.0, 98.0, 156.0]),
    (27, [140.0, 153.0, 101.0]),
    (28, [158.0, 218.0, 229.0]),
    (29, [100.0, 125.0, 154.0]),
    (30, [178.0, 127.0, 135.0]),
    (32, [146.0, 111.0, 194.0]),
    (33, [44.0, 160.0, 44.0]),
    (34, [112.0, 128.0, 144.0]),
    (35, [96.0, 207.0, 209.0]),
    (36, [227.0, 119.0, 194.0]),
    (37, [213.0, 92.0, 176.0]),
    (38, [94.0, 106.0, 211.0]),
    (39, [82.0, 84.0, 163.0]),
    (40, [100.0, 85.0, 144.0]),
];

pub fn color_for(class_id: u32) -> Option<[f32; 3]> {
    SCANNET_COLOR_MAP
        .iter()
        .find(|(id, _)| *id == class_id)
        .map(|(_, rgb)| *rgb)
}

/// Highest raw id the palette knows about.
pub fn max_known_class_id() -> u32 {
    SCANNET_COLOR_MAP.iter().map(|(id, _)| *id).max().unwrap_or(0)
}

pub fn num_classes() -> usize {
    VALID_CLASS_IDS.len()
}

/// Name of a dense class index.
pub fn class_name(dense: i32) -> Option<&'static str> {
    usize::try_from(dense).ok().and_then(|i| CLASS_LABELS.get(i).copied())
}

/// Total map from raw class id to dense index or [`IGNORE_LABEL`].
///
/// Dense indices follow the order of the list handed to [`LabelRemap::new`];
/// a repeated id keeps its first position. Ids up to `max_known_id` live in a
/// flat table, larger valid ids in a sorted side list. Everything else maps to
/// [`IGNORE_LABEL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRemap {
    table: Vec<i32>,
    sparse: Vec<(u32, i32)>,
    num_classes: usize,
}

impl LabelRemap {
    pub fn new(valid_ids: &[u32], max_known_id: u32) -> Self {
        let mut table = vec![IGNORE_LABEL; max_known_id as usize + 1];
        let mut sparse: Vec<(u32, i32)> = Vec::new();

        let mut num_classes = 0;
        for &id in valid_ids {
            let fresh = match table.get_mut(id as usize) {
                Some(slot) if *slot == IGNORE_LABEL => {
                    *slot = num_classes as i32;
                    true
                }
                Some(_) => false,
                None if sparse.iter().any(|&(known, _)| known == id) => false,
                None => {
                    sparse.push((id, num_classes as i32));
                    true
                }
            };
            if fresh {
                num_classes += 1;
            }
        }
        sparse.sort_unstable_by_key(|&(id, _)| id);

        Self {
            table,
            sparse,
            num_classes,
        }
    }

    /// Remap for the 20-class benchmark.
    pub fn scannet() -> Self {
        Self::new(&VALID_CLASS_IDS, max_known_class_id())
    }

    #[inline]
    pub fn map(&self, raw: u32) -> i32 {
        match self.table.get(raw as usize) {
            Some(&dense) => dense,
            None => self
                .sparse
                .binary_search_by_key(&raw, |&(id, _)| id)
                .map(|i| self.sparse[i].1)
                .unwrap_or(IGNORE_LABEL),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}
