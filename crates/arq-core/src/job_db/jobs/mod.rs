//! Job CRUD, split into read and write operations.

mod read;
mod write;
