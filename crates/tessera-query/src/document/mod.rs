//! Document-store translation
//!
//! Conditions become BSON filter documents; grouped queries become
//! aggregation pipelines (`$match`, `$group`, `$sort`, `$skip`, `$limit`).

mod codec;
mod filter;
mod pipeline;
mod update;

pub use codec::{
    bson_to_value, document_to_row, id_to_bson, row_to_document, value_to_bson, DocumentCodec,
    DOCUMENT_ID,
};
pub use pipeline::{group_row, FindPlan, COUNT_FIELD};
pub use update::UpdatePlan;

use bson::Document;
use tessera_core::{Condition, Schema, StoreResult};

use crate::ConditionTranslator;
use filter::{FilterBuilder, Namespace};

/// Stateless translator for document stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentTranslator;

impl DocumentTranslator {
    /// Filter document for `condition`; empty matches everything.
    pub fn filter(&self, schema: &Schema, condition: Option<&Condition>) -> StoreResult<Document> {
        FilterBuilder::new(Namespace::Table(schema)).build(condition)
    }
}

impl ConditionTranslator for DocumentTranslator {
    type Output = Document;

    fn name(&self) -> &str {
        "document"
    }

    fn translate(&self, schema: &Schema, condition: Option<&Condition>) -> StoreResult<Document> {
        self.filter(schema, condition)
    }
}
