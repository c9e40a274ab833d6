pub mod fsx;
pub mod validator;
