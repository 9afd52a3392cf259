//! The binary packet codec: field types, schemas, packets and the encode / decode engine.

pub mod bits;
pub mod codec;
pub mod codec_error;
pub mod conversion_cache;
mod convert;
pub mod enums;
pub mod field_type;
pub mod frame;
pub mod messages;
pub mod packet;
pub mod schema;
pub mod value;
