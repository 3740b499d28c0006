pub mod si;
