pub mod area;
pub mod clock;
pub mod guard;
pub mod mandate;
pub mod matrix;
pub mod prediction;
pub mod types;
pub mod votes;
