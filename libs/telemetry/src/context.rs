/// Label set attached to metrics emitted while handling one Instagram event.
#[derive(Debug, Clone)]
pub struct EventLabels {
    pub account: String,
    pub surface: Option<String>,
    pub media_id: Option<String>,
    pub event_id: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl EventLabels {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            surface: None,
            media_id: None,
            event_id: None,
            extra: Vec::new(),
        }
    }

    pub fn with_surface(mut self, surface: impl Into<String>) -> Self {
        self.surface = Some(surface.into());
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(4 + self.extra.len());
        tags.push(("account".into(), self.account.clone()));
        if let Some(surface) = &self.surface {
            tags.push(("surface".into(), surface.clone()));
        }
        if let Some(media) = &self.media_id {
            tags.push(("media_id".into(), media.clone()));
        }
        if let Some(event) = &self.event_id {
            tags.push(("event_id".into(), event.clone()));
        }
        for (key, value) in &self.extra {
            tags.push((key.clone(), value.clone()));
        }
        tags
    }
}
