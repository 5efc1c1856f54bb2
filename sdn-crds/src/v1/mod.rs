pub mod hostsubnet;
pub mod netnamespace;
