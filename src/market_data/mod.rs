pub mod bar_window;
pub mod sim_feed;

pub use bar_window::{BarWindow, PriceBar};
