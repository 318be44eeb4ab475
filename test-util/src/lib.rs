pub use synthetic::{GaussianSource, SyntheticPatch, add_gaussian_noise, centered_coordinates};

mod synthetic;
