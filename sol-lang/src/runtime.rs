//! Types that make up the values manipulated by running programs.

pub mod value;
