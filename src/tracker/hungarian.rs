// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Hungarian algorithm (Jonker-Volgenant-free, O(n^3) Kuhn-Munkres) over a
//! dense rectangular cost matrix, used by the cascade and IoU matching
//! stages to find a minimum-cost assignment.

const INF: f64 = 1.0e18;

/// Solves the rectangular assignment problem for `cost[row][col]`, padding
/// the smaller dimension with zero-cost dummy entries. Returns one entry per
/// real row: `Some(col)` if matched to a real column, `None` if matched only
/// to a padding column (i.e. unassigned).
pub fn solve(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let rows = cost.len();
    if rows == 0 {
        return Vec::new();
    }
    let cols = cost[0].len();
    if cols == 0 {
        return vec![None; rows];
    }

    let n = rows.max(cols);
    let mut a = vec![vec![0.0f64; n + 1]; n + 1];
    for (i, row) in cost.iter().enumerate() {
        for (j, &c) in row.iter().enumerate() {
            a[i + 1][j + 1] = c;
        }
    }

    // Standard O(n^3) successive-shortest-paths Kuhn-Munkres (1-indexed, as
    // is traditional for this algorithm's potential bookkeeping).
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut p = vec![0usize; n + 1]; // p[j] = row matched to column j
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![INF; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = INF;
            let mut j1 = 0usize;

            for j in 1..=n {
                if !used[j] {
                    let cur = a[i0][j] - u[i0] - v[j];
                    if cur < minv[j] {
                        minv[j] = cur;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![None; rows];
    for j in 1..=n {
        if p[j] != 0 && p[j] <= rows && j <= cols {
            row_to_col[p[j] - 1] = Some(j - 1);
        }
    }
    row_to_col
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn matches_spec_example() {
        // [[0.1, 0.9], [0.9, 0.2]] -> [0, 1], total cost 0.3.
        let cost = vec![vec![0.1, 0.9], vec![0.9, 0.2]];
        let result = solve(&cost);
        assert_eq!(result, vec![Some(0), Some(1)]);
    }

    #[test]
    fn rectangular_more_rows_than_cols() {
        let cost = vec![vec![1.0], vec![2.0], vec![0.5]];
        let result = solve(&cost);
        // exactly one row gets the single column, the rest are unmatched.
        assert_eq!(result.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(result[2], Some(0));
    }

    #[test]
    fn empty_cost_matrix_returns_empty() {
        let cost: Vec<Vec<f64>> = Vec::new();
        assert_eq!(solve(&cost), Vec::<Option<usize>>::new());
    }
}
