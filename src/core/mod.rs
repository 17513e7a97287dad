pub mod indicators;
pub mod patterns;
pub mod structure;
pub mod zones;
