pub mod disk;
pub mod index;
pub mod persistence;
