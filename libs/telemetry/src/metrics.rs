use metrics::Label;

use crate::context::EventLabels;

fn to_labels(labels: &EventLabels) -> Vec<Label> {
    labels
        .tags()
        .into_iter()
        .map(|(key, value)| Label::new(key, value))
        .collect()
}

pub fn record_counter(name: &'static str, value: u64, labels: &EventLabels) {
    metrics::counter!(name, to_labels(labels)).increment(value);
}
