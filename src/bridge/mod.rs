//! Bridge Manager (G): owns the live bridge vector and drives rotation and
//! elastic resize on top of the Engine Launcher (D).

pub mod manager;
