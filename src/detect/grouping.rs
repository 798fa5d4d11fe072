//! Post-processing of raw multi-scale classifier hits.

use crate::detect::backend::Hit;
use crate::detect::result::Rect;

/// Relative tolerance for two rectangles to count as the same object.
const GROUP_EPS: f32 = 0.2;

/// Cluster similar rectangles and average each cluster.
///
/// Clusters with `min_neighbors` or fewer members are discarded. With
/// `min_neighbors == 0` the input is returned unchanged.
pub fn group_rectangles(rects: &[Rect], min_neighbors: u32) -> Vec<Rect> {
    if min_neighbors == 0 {
        return rects.to_vec();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j]) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    // Per cluster root: member count and coordinate sums.
    let mut clusters: Vec<(usize, u32, [u64; 4])> = Vec::new();
    for (i, rect) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        let idx = match clusters.iter().position(|(r, _, _)| *r == root) {
            Some(idx) => idx,
            None => {
                clusters.push((root, 0, [0; 4]));
                clusters.len() - 1
            }
        };
        let entry = &mut clusters[idx];
        entry.1 += 1;
        entry.2[0] += rect.x as u64;
        entry.2[1] += rect.y as u64;
        entry.2[2] += rect.w as u64;
        entry.2[3] += rect.h as u64;
    }

    clusters
        .into_iter()
        .filter(|(_, count, _)| *count > min_neighbors)
        .filter_map(|(_, count, sums)| {
            let c = count as u64;
            Rect::new(
                (sums[0] / c) as u32,
                (sums[1] / c) as u32,
                (sums[2] / c) as u32,
                (sums[3] / c) as u32,
            )
        })
        .collect()
}

fn similar(a: &Rect, b: &Rect) -> bool {
    let delta = GROUP_EPS * (a.w.min(b.w) + a.h.min(b.h)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

/// Greedy non-maximum suppression: keep the highest-weighted hit of every group of
/// hits overlapping by more than `max_iou`.
pub fn suppress_overlaps(mut hits: Vec<Hit>, max_iou: f32) -> Vec<Hit> {
    hits.sort_by(|a, b| {
        b.weight
            .unwrap_or(0.0)
            .partial_cmp(&a.weight.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Hit> = Vec::with_capacity(hits.len());
    for hit in hits {
        if kept.iter().all(|k| k.rect.iou(&hit.rect) <= max_iou) {
            kept.push(hit);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: u32, y: u32, w: u32, h: u32) -> Rect {
        Rect::new(x, y, w, h).unwrap()
    }

    #[test]
    fn clusters_below_neighbor_count_are_dropped() {
        let rects = [
            rect(10, 10, 20, 20),
            rect(11, 10, 20, 20),
            rect(10, 11, 20, 21),
            rect(100, 100, 20, 20),
        ];
        let grouped = group_rectangles(&rects, 2);
        assert_eq!(grouped, vec![rect(10, 10, 20, 20)]);
    }

    #[test]
    fn zero_neighbors_keeps_everything() {
        let rects = [rect(0, 0, 5, 5), rect(50, 50, 5, 5)];
        assert_eq!(group_rectangles(&rects, 0), rects.to_vec());
    }

    #[test]
    fn suppression_keeps_strongest() {
        let hits = vec![
            Hit {
                rect: rect(0, 0, 64, 128),
                weight: Some(0.4),
            },
            Hit {
                rect: rect(4, 4, 64, 128),
                weight: Some(0.9),
            },
            Hit {
                rect: rect(200, 0, 64, 128),
                weight: Some(0.1),
            },
        ];
        let kept = suppress_overlaps(hits, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].weight, Some(0.9));
        assert_eq!(kept[1].rect, rect(200, 0, 64, 128));
    }
}
