pub mod assembler;
pub mod attribution;
pub mod converted;
pub mod filters;
pub mod group_by;
pub mod sessions;
