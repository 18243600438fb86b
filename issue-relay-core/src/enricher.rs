use crate::message::{EnrichedItem, Item};

/// Summarization over an [OpenAI-compatible] chat-completions endpoint.
///
/// [OpenAI-compatible]: https://platform.openai.com/docs/api-reference/chat/create
pub mod openai;

/// Turns one [Item] into its [EnrichedItem]. Implementations do not retry, the pipeline decides
/// what happens with a failure.
#[trait_variant::make(Enricher: Send)]
pub trait LocalEnricher {
    async fn enrich(&self, item: &Item) -> crate::Result<EnrichedItem>;
}
