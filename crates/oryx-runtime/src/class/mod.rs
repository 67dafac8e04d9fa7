//! Class metadata and the class-initialization state machine
//!
//! A [`ClassMetadata`] is the runtime descriptor of a loaded class: name,
//! loader, supertypes, field and method tables, and the initialization state
//! machine that guarantees a class initializer body runs exactly once no
//! matter how many threads race to trigger it.

pub mod init;
pub mod layout;
pub mod metadata;
pub mod registry;

pub use init::{InitState, VmException};
pub use layout::{compute_instance_layout, FieldKind, InstanceLayout, OBJECT_HEADER_BYTES};
pub use metadata::{
    ClassFlags, ClassId, ClassMetadata, ClassSupport, DefaultClassSupport, FieldDescriptor,
    ITable, ITableEntry, LoaderId, MethodDescriptor, MethodId, VTable,
};
pub use registry::ClassRegistry;

/// Errors raised by class linking and initialization
#[derive(Debug, thiserror::Error)]
pub enum ClassError {
    /// The class previously failed initialization; every later attempt
    /// observes the same sticky failure.
    #[error("Could not initialize class {class}")]
    NoClassDefFound {
        /// Name of the class whose initialization failed
        class: String,
    },

    /// The class initializer body threw a non-Error exception
    #[error("Exception in initializer of class {class}: {message}")]
    ExceptionInInitializer {
        /// Name of the class whose initializer threw
        class: String,
        /// Message of the underlying exception
        message: String,
    },

    /// A supertype required by this class failed to initialize
    #[error("Initialization of supertype {supertype} failed while initializing {class}")]
    SupertypeFailed {
        /// Name of the class being initialized
        class: String,
        /// Name of the supertype that failed
        supertype: String,
        /// The supertype's own failure
        #[source]
        source: Box<ClassError>,
    },

    /// The initializer threw an Error-kinded exception, which propagates
    /// unwrapped
    #[error("Error in initializer of class {class}: {message}")]
    InitializerError {
        /// Name of the class whose initializer threw
        class: String,
        /// Message of the underlying error
        message: String,
    },

    /// Bytecode verification rejected the class
    #[error("Verification of class {class} failed: {reason}")]
    Verify {
        /// Name of the rejected class
        class: String,
        /// Verifier diagnostic
        reason: String,
    },

    /// Linking failed for a reason other than verification
    #[error("Linkage error in class {class}: {reason}")]
    Linkage {
        /// Name of the class that failed to link
        class: String,
        /// Linker diagnostic
        reason: String,
    },
}
