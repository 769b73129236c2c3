pub mod correlation;
pub mod dispatcher;
pub mod guidance;
pub mod guidance_state;
pub mod image_io;
pub mod log_sink;
pub mod pixel_grid;
pub mod subpixel;
pub mod template;
