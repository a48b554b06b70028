pub mod classifier;
pub mod compiler;
pub mod dedup;
pub mod emitter;
pub mod normalizer;
pub mod render;
pub mod scheduler;
pub mod selector;
pub mod sources;
pub mod store;
pub mod traits;
pub mod types;

pub use types::*;
pub use classifier::{Classifier, ClassifierRule, GENERAL_SECTION};
pub use compiler::{default_section_titles, DigestCompiler};
pub use dedup::dedup;
pub use emitter::{EmitReport, MultiFormatEmitter, RenderFailure};
pub use normalizer::{normalize, normalize_batch};
pub use render::{default_renderers, HtmlRenderer, MarkdownRenderer, TextRenderer};
pub use scheduler::{
    CompileOutcome, CompileRunRecord, CompileSuccess, DeliveryReport, RunStatus, ScanCycleReport,
    Scheduler,
};
pub use selector::{select_delivery_jobs, DeliverySelection, SkippedDelivery};
pub use sources::JsonFileScanner;
pub use store::PipelineStore;
pub use traits::{InMemorySubscriberStore, Renderer, Scanner, SubscriberStore, Transport};
