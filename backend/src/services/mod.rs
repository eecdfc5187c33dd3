pub mod background_service;
pub mod chat_service;
pub mod embedding_service;
pub mod learning_service;
pub mod memory_service;
pub mod optimizer_service;
pub mod retrieval_service;
