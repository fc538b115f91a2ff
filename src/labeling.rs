//! Connected-component labeling: boolean mask -> dense positive labels (§4.C).
//!
//! Two-pass union-find over 4-connectivity, matching
//! `skimage.measure.label(img, connectivity=1)` as used by the original
//! tracker (`original_source/.../tracking/old.py::Tracker.label`).

use ndarray::Array2;

/// Union-find over small integer ids, path-compressing on find.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Label one boolean frame with 4-connectivity. Background (`false`) stays 0;
/// each 4-connected foreground component gets a dense positive id starting
/// at 1, assigned in raster order.
pub fn label_frame(mask: &Array2<bool>) -> Array2<u16> {
    let (h, w) = mask.dim();
    let mut provisional = Array2::<usize>::zeros((h, w));
    let mut uf = DisjointSet::new(h * w + 1);
    let mut next_id = 1usize;

    for y in 0..h {
        for x in 0..w {
            if !mask[[y, x]] {
                continue;
            }
            let up = if y > 0 && mask[[y - 1, x]] {
                provisional[[y - 1, x]]
            } else {
                0
            };
            let left = if x > 0 && mask[[y, x - 1]] {
                provisional[[y, x - 1]]
            } else {
                0
            };
            let id = match (up, left) {
                (0, 0) => {
                    let id = next_id;
                    next_id += 1;
                    id
                }
                (0, l) => l,
                (u, 0) => u,
                (u, l) => {
                    if u != l {
                        uf.union(u, l);
                    }
                    u.min(l)
                }
            };
            provisional[[y, x]] = id;
        }
    }

    // Map each provisional id's root to a dense 1..n id, in raster order of
    // first appearance so labels stay deterministic across runs.
    let mut root_to_dense: std::collections::HashMap<usize, u16> = std::collections::HashMap::new();
    let mut dense_next: u16 = 1;
    let mut out = Array2::<u16>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let id = provisional[[y, x]];
            if id == 0 {
                continue;
            }
            let root = uf.find(id);
            let dense = *root_to_dense.entry(root).or_insert_with(|| {
                let d = dense_next;
                dense_next += 1;
                d
            });
            out[[y, x]] = dense;
        }
    }
    out
}

/// Label every frame of a stack independently (no cross-frame constraint).
pub fn label_stack(frames: &[Array2<bool>]) -> Vec<Array2<u16>> {
    frames.iter().map(label_frame).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mask_has_no_labels() {
        let mask = Array2::from_elem((5, 5), false);
        let labels = label_frame(&mask);
        assert!(labels.iter().all(|&v| v == 0));
    }

    #[test]
    fn single_blob_gets_one_label() {
        let mut mask = Array2::from_elem((5, 5), false);
        for y in 1..3 {
            for x in 1..3 {
                mask[[y, x]] = true;
            }
        }
        let labels = label_frame(&mask);
        let distinct: std::collections::HashSet<u16> =
            labels.iter().cloned().filter(|&v| v != 0).collect();
        assert_eq!(distinct.len(), 1);
        assert_eq!(labels[[1, 1]], labels[[2, 2]]);
    }

    #[test]
    fn diagonal_touching_blobs_are_separate_under_4_connectivity() {
        let mut mask = Array2::from_elem((4, 4), false);
        mask[[1, 1]] = true;
        mask[[2, 2]] = true;
        let labels = label_frame(&mask);
        assert_ne!(labels[[1, 1]], labels[[2, 2]]);
        assert_eq!(labels[[1, 1]], 1);
        assert_eq!(labels[[2, 2]], 2);
    }

    #[test]
    fn u_shaped_blob_merges_into_one_label_via_union_find() {
        // Two provisional seeds that later join, forcing a union.
        let mut mask = Array2::from_elem((3, 3), false);
        mask[[0, 0]] = true;
        mask[[0, 2]] = true;
        mask[[0, 1]] = true; // bridges them on the same row
        let labels = label_frame(&mask);
        assert_eq!(labels[[0, 0]], labels[[0, 2]]);
    }

    #[test]
    fn labels_are_dense_starting_at_one() {
        let mut mask = Array2::from_elem((5, 5), false);
        mask[[0, 0]] = true;
        mask[[4, 4]] = true;
        let labels = label_frame(&mask);
        let mut distinct: Vec<u16> = labels.iter().cloned().filter(|&v| v != 0).collect();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct, vec![1, 2]);
    }
}
