pub mod confluence;
pub mod filters;
pub mod mode_selector;
pub mod signals;
