pub mod capture;
pub mod detection_loop;
pub mod endpoints;
pub mod error;
pub mod labels;
pub mod live_view;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod sensors;
pub mod utils;
