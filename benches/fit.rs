use criterion::Criterion;
use std::hint::black_box;
use shapelet_fit::{
    Basis, BasisTrait, EllipseCore, FitterConfig, ImagePatch, InitialGuess, PixelData, PsfModel,
    SourceFitter, SubproblemMethod, TrustRegionConfig,
};
use shapelet_fit_test_util::{GaussianSource, SyntheticPatch};

const PSF_SIGMA: f64 = 2.0;

fn patch(seed: u64) -> ImagePatch {
    let psf = PsfModel::circular_gaussian(PSF_SIGMA).moments();
    let ellipse = EllipseCore::new(0.2, -0.1, 2.5);
    let source = GaussianSource::new([0.3, 0.4], ellipse.quadrupole(), 100.0).convolved(psf);
    let synthetic = SyntheticPatch::new((41, 41), &[source], 1e-4).with_noise(seed);
    ImagePatch::centered(synthetic.image, synthetic.variance).unwrap()
}

pub fn bench_basis_evaluation(c: &mut Criterion) {
    let pixels = PixelData::from_patch(&patch(0)).unwrap();
    let psf = PsfModel::double_gaussian(1.5, 4.0, 0.1);
    let nonlinear = [0.3, 0.4, 0.2, -0.1, 2.5];

    let bases = [
        ("Gaussian basis evaluation", Basis::gaussian()),
        ("Shapelet order 4 basis evaluation", Basis::shapelet(4)),
    ];
    for (name, basis) in bases {
        c.bench_function(name, |b| {
            b.iter(|| basis.evaluate(black_box(&pixels), black_box(&nonlinear), &psf));
        });
    }
}

pub fn bench_fit(c: &mut Criterion) {
    const N: u64 = 16;

    let psf = PsfModel::circular_gaussian(PSF_SIGMA);
    let patches: Vec<_> = (0..N).map(patch).collect();

    let fitters = [
        (
            "Gaussian fit: dogleg",
            FitterConfig::default().with_solver(
                TrustRegionConfig::default().with_subproblem(SubproblemMethod::Dogleg),
            ),
        ),
        (
            "Gaussian fit: Steihaug CG",
            FitterConfig::default().with_solver(
                TrustRegionConfig::default().with_subproblem(SubproblemMethod::SteihaugCg),
            ),
        ),
        (
            "Shapelet order 2 fit: dogleg",
            FitterConfig::default().with_basis(Basis::shapelet(2)),
        ),
    ];

    for (name, config) in fitters {
        let fitter = SourceFitter::new(config);
        c.bench_function(name, |b| {
            b.iter(|| {
                patches.iter().for_each(|patch| {
                    let guess = InitialGuess::from_moments(patch, &psf).unwrap();
                    let _ = fitter.fit(black_box(patch), &psf, &guess);
                });
            });
        });
    }
}
