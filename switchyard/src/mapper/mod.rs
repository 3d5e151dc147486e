//! Conversion between request data and handler parameters on the way in, and
//! between handler results and the response on the way out.

pub mod argument;
pub mod body;
mod defaults;
pub mod reply;
pub mod response;

pub use argument::{
    Annotation, ArgumentMapper, ArgumentMapperTable, Arguments, DynArgumentMapper, Parameter,
    Source, erase_argument_mapper,
};
pub use body::MultiMap;
pub use reply::{Completion, Entity, EntityError, Reply, Returned};
pub use response::{
    DynReturnTypeMapper, ReturnKey, ReturnTypeMapper, ReturnTypeMapperTable, erase_return_mapper,
    write_entity,
};
