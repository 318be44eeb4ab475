use crate::ellipse::Quadrupole;

/// Number of `(p, q)` terms with `p + q <= order`
pub const fn n_terms(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// Position of the `(p, q)` term in the triangular layout shared by bases and derivative tables
///
/// Terms are ordered by total order `k = p + q`, then by `q`.
pub const fn term_index(p: usize, q: usize) -> usize {
    let k = p + q;
    k * (k + 1) / 2 + q
}

/// Iterator over `(p, q)` pairs of a basis of the given order in [term_index] order
pub fn terms(order: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..=order).flat_map(|k| (0..=k).map(move |q| (k - q, q)))
}

/// Table of partial derivatives $\partial_x^p \partial_y^q G(u)$ of a bivariate Gaussian
///
/// The Gaussian is $G(u) = A \exp(-u^T \Lambda u / 2)$ with precision matrix $\Lambda$. With
/// $w = \Lambda u$ the derivatives obey
///
/// $$
/// D_{p+1,q} = -w_x D_{p,q} - p \Lambda_{xx} D_{p-1,q} - q \Lambda_{xy} D_{p,q-1},
/// $$
///
/// and the same relation with $x$ and $y$ swapped, so every entry costs a few multiplications.
#[derive(Clone, Debug)]
pub(crate) struct GaussianDerivatives {
    max_order: usize,
    values: Vec<f64>,
}

impl GaussianDerivatives {
    pub fn new(max_order: usize) -> Self {
        Self {
            max_order,
            values: vec![0.0; n_terms(max_order)],
        }
    }

    /// Fill the table at offset `u` for precision `lambda` and amplitude `a`
    pub fn compute(&mut self, u: [f64; 2], lambda: Quadrupole, a: f64) {
        let [lxx, lyy, lxy] = lambda;
        let wx = lxx * u[0] + lxy * u[1];
        let wy = lxy * u[0] + lyy * u[1];
        self.values[0] = a * f64::exp(-0.5 * (u[0] * wx + u[1] * wy));
        for k in 1..=self.max_order {
            for q in 0..=k {
                let p = k - q;
                let value = if p > 0 {
                    let mut v = -wx * self.get(p - 1, q);
                    if p >= 2 {
                        v -= (p - 1) as f64 * lxx * self.get(p - 2, q);
                    }
                    if q >= 1 {
                        v -= q as f64 * lxy * self.get(p - 1, q - 1);
                    }
                    v
                } else {
                    let mut v = -wy * self.get(0, q - 1);
                    if q >= 2 {
                        v -= (q - 1) as f64 * lyy * self.get(0, q - 2);
                    }
                    v
                };
                self.values[term_index(p, q)] = value;
            }
        }
    }

    #[inline]
    pub fn get(&self, p: usize, q: usize) -> f64 {
        self.values[term_index(p, q)]
    }
}
