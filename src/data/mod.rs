mod image_patch;
pub use image_patch::ImagePatch;

mod pixel_data;
pub use pixel_data::PixelData;
