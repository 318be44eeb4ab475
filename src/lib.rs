#![doc = include_str!("../README.md")]

pub mod basis;
pub use basis::{Basis, BasisComponent, BasisEvaluation, BasisTrait, N_NONLINEAR};

mod data;
pub use data::{ImagePatch, PixelData};

mod ellipse;
pub use ellipse::{EllipseCore, Quadrupole};

mod error;
pub use error::FitError;

pub mod nl_fit;
pub use nl_fit::{
    CancellationToken, ConvergenceCriterion, FitResult, FitStatus, FitterConfig, InitialGuess,
    IterationRecord, ParameterBounds, SourceFitter, SubproblemMethod, TrustRegionConfig,
};
pub use nl_fit::{MixtureComponent, MixturePrior, Prior, PriorTrait};

mod psf;
pub use psf::{PsfComponent, PsfModel};

pub use nalgebra;
pub use ndarray;
