//! Greedy graph colorings for compressed Jacobian and Hessian evaluation.
//!
//! All colorings visit vertices in decreasing-degree order and assign the
//! smallest color not forbidden by already colored vertices. They return
//! `(colors, num_colors)` where `colors[v]` is the color of vertex `v`.

use super::Sparsity;

const UNCOLORED: usize = usize::MAX;

/// Color the columns so that no two columns of one color share a row.
///
/// Seeding all columns of one color at once then yields every Jacobian entry
/// of those columns without cancellation (forward-mode compression).
pub fn column_coloring(sp: &Sparsity) -> (Vec<usize>, usize) {
    let ncol = sp.ncol();
    if ncol == 0 {
        return (Vec::new(), 0);
    }
    let rows = sp.transpose();

    let mut order: Vec<usize> = (0..ncol).collect();
    let degree = |c: usize| sp.colind()[c + 1] - sp.colind()[c];
    order.sort_by(|&a, &b| degree(b).cmp(&degree(a)));

    let mut colors = vec![UNCOLORED; ncol];
    // forbidden[color] == v marks the color as taken while coloring v
    let mut forbidden = vec![UNCOLORED; ncol];
    let mut num_colors = 0;

    for &v in &order {
        for &r in &sp.row()[sp.colind()[v]..sp.colind()[v + 1]] {
            for &u in &rows.row()[rows.colind()[r]..rows.colind()[r + 1]] {
                if colors[u] != UNCOLORED {
                    forbidden[colors[u]] = v;
                }
            }
        }
        let mut color = 0;
        while forbidden[color] == v {
            color += 1;
        }
        colors[v] = color;
        num_colors = num_colors.max(color + 1);
    }

    (colors, num_colors)
}

/// Color the rows so that no two rows of one color share a column
/// (reverse-mode compression).
pub fn row_coloring(sp: &Sparsity) -> (Vec<usize>, usize) {
    column_coloring(&sp.transpose())
}

/// Star coloring of the adjacency graph of a square pattern.
///
/// The graph has an edge `(i, j)` for every off-diagonal nonzero of the
/// pattern or of its transpose. The coloring is proper and every path on four
/// vertices uses at least three colors. Consequently, for every nonzero
/// `(i, j)` either `j` is the only vertex of its color among the nonzeros of
/// row `i`, or `i` is the only vertex of its color among the nonzeros of
/// row `j`, which is what symmetric recovery relies on.
pub fn star_coloring(sp: &Sparsity) -> (Vec<usize>, usize) {
    let n = sp.nrow().max(sp.ncol());
    if n == 0 {
        return (Vec::new(), 0);
    }

    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (r, c) in sp.iter() {
        if r != c {
            adj[r].push(c);
            adj[c].push(r);
        }
    }
    for list in adj.iter_mut() {
        list.sort_unstable();
        list.dedup();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| adj[b].len().cmp(&adj[a].len()));

    let mut colors = vec![UNCOLORED; n];
    let mut forbidden = vec![UNCOLORED; n];
    let mut num_colors = 0;
    let mut neighbor_colors: Vec<usize> = Vec::new();

    for &v in &order {
        neighbor_colors.clear();

        // Distance-1: proper coloring.
        for &w in &adj[v] {
            if colors[w] != UNCOLORED {
                forbidden[colors[w]] = v;
                neighbor_colors.push(colors[w]);
            }
        }

        // v at the end of a path v-w-x-y colored (?, a, c, a): c is taken.
        for &w in &adj[v] {
            let a = colors[w];
            if a == UNCOLORED {
                continue;
            }
            for &x in &adj[w] {
                if x == v || colors[x] == UNCOLORED {
                    continue;
                }
                if adj[x].iter().any(|&y| y != w && colors[y] == a) {
                    forbidden[colors[x]] = v;
                }
            }
        }

        // v inside a path u-v-x-y where u and x share a color: color(y) is taken.
        neighbor_colors.sort_unstable();
        for &x in &adj[v] {
            let a = colors[x];
            if a == UNCOLORED {
                continue;
            }
            let lo = neighbor_colors.partition_point(|&c| c < a);
            let hi = neighbor_colors.partition_point(|&c| c <= a);
            if hi - lo < 2 {
                continue;
            }
            for &y in &adj[x] {
                if y != v && colors[y] != UNCOLORED {
                    forbidden[colors[y]] = v;
                }
            }
        }

        let mut color = 0;
        while forbidden[color] == v {
            color += 1;
        }
        colors[v] = color;
        num_colors = num_colors.max(color + 1);
    }

    (colors, num_colors)
}
