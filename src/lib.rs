//! wordpq: IVFADC and product-quantization indexing for word vectors.

pub mod config;
pub mod corpus;
pub mod error;
pub mod evaluation;
pub mod index;
pub mod startup;
pub mod storage;
pub mod types;
