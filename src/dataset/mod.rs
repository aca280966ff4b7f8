//! Dataset module for co-registered multi-modality volumes
//!
//! This module provides:
//! - Index-file parsing and eager file validation (`loader`)
//! - Volume transforms: crop-or-pad, min-max normalization, label binarization (`volume`)
//! - Burn `Dataset`/`Batcher` integration (`burn_dataset`)
//! - Seeded train/validation split and epoch shuffling (`split`)

pub mod burn_dataset;
pub mod loader;
pub mod split;
pub mod volume;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub use burn_dataset::{InMemoryVolumes, SampleSource, VolumeBatch, VolumeBatcher, VolumeItem};
pub use loader::{parse_index, IndexEntry, SliceStackReader, VolumeDataset, VolumeReader};
pub use split::DatasetSplit;
pub use volume::Volume;

/// Generate a synthetic sample: an ellipsoidal organ on a noisy background.
///
/// The auxiliary modality shows the same organ shifted by up to one voxel
/// with inverted contrast, so registration has something to learn.
pub fn synthetic_item(id: &str, shape: [usize; 3], seed: u64) -> VolumeItem {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let [d, h, w] = shape;
    let centre = [
        d as f32 / 2.0 + rng.gen_range(-0.5..0.5),
        h as f32 / 2.0 + rng.gen_range(-1.0..1.0),
        w as f32 / 2.0 + rng.gen_range(-1.0..1.0),
    ];
    let radii = [(d as f32 / 3.0).max(1.0), h as f32 / 4.0, w as f32 / 4.0];
    let shift = [0, rng.gen_range(-1i64..=1), rng.gen_range(-1i64..=1)];

    let inside = |z: f32, y: f32, x: f32| {
        let q = ((z - centre[0]) / radii[0]).powi(2)
            + ((y - centre[1]) / radii[1]).powi(2)
            + ((x - centre[2]) / radii[2]).powi(2);
        q <= 1.0
    };

    let n = d * h * w;
    let mut primary = Vec::with_capacity(n);
    let mut label = Vec::with_capacity(n);
    let mut auxiliary = Vec::with_capacity(n);
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let organ = inside(z as f32, y as f32, x as f32);
                let moved = inside(
                    z as f32 - shift[0] as f32,
                    y as f32 - shift[1] as f32,
                    x as f32 - shift[2] as f32,
                );
                let noise: f32 = rng.gen_range(0.0..0.1);
                label.push(if organ { 1.0 } else { 0.0 });
                primary.push(if organ { 0.8 } else { 0.2 } + noise);
                auxiliary.push(if moved { 0.3 } else { 0.7 } + noise);
            }
        }
    }

    VolumeItem {
        id: id.to_string(),
        primary: Volume { data: primary, shape },
        label: Volume { data: label, shape },
        auxiliary: Volume { data: auxiliary, shape },
    }
}

/// `count` synthetic samples with distinct seeds
pub fn synthetic_dataset(count: usize, shape: [usize; 3], seed: u64) -> InMemoryVolumes {
    InMemoryVolumes::new(
        (0..count)
            .map(|i| synthetic_item(&format!("synthetic_{:03}", i), shape, seed.wrapping_add(i as u64)))
            .collect(),
    )
}
