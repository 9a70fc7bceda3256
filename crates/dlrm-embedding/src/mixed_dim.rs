//! Width assignment for mixed-dimension tables.

/// Assigns a width to every table with the alpha power rule.
///
/// Tables are ranked by row count; the smallest gets `base_dim` and every
/// other table gets `round(base_dim * (n_min / n)^alpha)`, floored at 1.
/// With `round_dims` each width is rounded to the nearest power of two.
/// Widths come back in the input order.
///
/// ```
/// use dlrm_embedding::mixed_dim::md_solver;
///
/// let dims = md_solver(&[1000, 10, 100], 16, 0.5, false);
/// assert_eq!(dims, vec![2, 16, 5]);
/// ```
pub fn md_solver(rows: &[usize], base_dim: usize, alpha: f32, round_dims: bool) -> Vec<usize> {
    if rows.is_empty() {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by_key(|&i| rows[i]);

    let n0 = rows[order[0]].max(1) as f64;
    let lambda = base_dim as f64 * n0.powf(alpha as f64);

    let mut dims = vec![0usize; rows.len()];
    for (rank, &i) in order.iter().enumerate() {
        let d = if rank == 0 {
            base_dim as f64
        } else {
            (lambda * (rows[i].max(1) as f64).powf(-(alpha as f64))).max(1.0)
        };
        let d = d.round();
        dims[i] = if round_dims {
            2f64.powf(d.log2().round()) as usize
        } else {
            d as usize
        };
    }
    dims
}
