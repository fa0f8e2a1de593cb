pub mod image;
pub mod imageflowtemplate;
