//! Caption templates rendered for the publisher.

use crate::task::domain::Task;
use minijinja::{Environment, context};
use thiserror::Error;

/// Template used when none is configured.
pub const DEFAULT_CAPTION_TEMPLATE: &str = "{{ caption }}";

/// Errors raised while compiling or rendering a caption template.
#[derive(Debug, Error)]
#[error("caption template error: {0}")]
pub struct CaptionTemplateError(#[from] minijinja::Error);

/// Validated `minijinja` caption template.
///
/// The template sees `caption`, `kind`, `task_id` and `attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionTemplate {
    source: String,
}

impl CaptionTemplate {
    /// Compiles `source` once to reject syntax errors early.
    ///
    /// # Errors
    ///
    /// Returns [`CaptionTemplateError`] when the template does not parse.
    pub fn new(source: impl Into<String>) -> Result<Self, CaptionTemplateError> {
        let template_source = source.into();
        Environment::new().template_from_str(&template_source)?;
        Ok(Self {
            source: template_source,
        })
    }

    /// Renders the caption for `task`.
    ///
    /// A blank result becomes `None` so the publisher posts without a
    /// caption.
    ///
    /// # Errors
    ///
    /// Returns [`CaptionTemplateError`] when rendering fails.
    pub fn render(&self, task: &Task) -> Result<Option<String>, CaptionTemplateError> {
        let rendered = Environment::new().render_str(
            &self.source,
            context! {
                caption => task.caption().unwrap_or_default(),
                kind => task.kind().as_str(),
                task_id => task.id().to_string(),
                attempt => task.attempts(),
            },
        )?;
        let trimmed = rendered.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
    }
}

impl Default for CaptionTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_CAPTION_TEMPLATE.to_owned(),
        }
    }
}
