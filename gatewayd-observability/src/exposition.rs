//! Minimal model of the Prometheus text exposition format, enough to
//! re-label and merge the feeds scraped from plugin metrics sockets.

use std::collections::BTreeMap;

/// One metric family: its `# HELP` / `# TYPE` lines plus sample lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Family {
    pub meta: Vec<String>,
    pub samples: Vec<String>,
}

/// Group exposition text into families, keyed (and therefore sorted) by
/// family name.
///
/// Histogram and summary sub-samples (`_bucket`, `_sum`, `_count`) are
/// attributed to the family declared by the preceding `# TYPE` line; samples
/// with no declaration form their own untyped family.
pub fn parse_families(text: &str) -> BTreeMap<String, Family> {
    let mut families: BTreeMap<String, Family> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("# ") {
            let mut parts = rest.splitn(3, ' ');
            let keyword = parts.next().unwrap_or_default();
            let name = parts.next().unwrap_or_default();
            if (keyword == "HELP" || keyword == "TYPE") && !name.is_empty() {
                families.entry(name.to_string()).or_default().meta.push(line.to_string());
                current = Some(name.to_string());
            }
            // other comments are dropped
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let sample_name = sample_name(line);
        let family_name = match &current {
            Some(family) if belongs_to(family, sample_name) => family.clone(),
            _ => sample_name.to_string(),
        };
        families.entry(family_name).or_default().samples.push(line.to_string());
    }

    families.retain(|_, family| !family.samples.is_empty() || !family.meta.is_empty());
    families
}

/// Append `label="value"` to a sample line, creating the brace block when
/// the sample has no labels.
pub fn inject_label(sample: &str, label: &str, value: &str) -> String {
    // The value/timestamp tail cannot contain '}', so the last one closes
    // the label block.
    if let Some(close) = sample.rfind('}') {
        let (head, tail) = sample.split_at(close);
        let sep = if head.trim_end().ends_with('{') { "" } else { "," };
        format!("{head}{sep}{label}=\"{value}\"{tail}")
    } else {
        let split = sample.find(char::is_whitespace).unwrap_or(sample.len());
        let (name, tail) = sample.split_at(split);
        format!("{name}{{{label}=\"{value}\"}}{tail}")
    }
}

/// Encode families back to exposition text, sorted by family name.
pub fn encode(families: &BTreeMap<String, Family>) -> String {
    let mut out = String::new();
    for family in families.values() {
        for line in &family.meta {
            out.push_str(line);
            out.push('\n');
        }
        for line in &family.samples {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn sample_name(line: &str) -> &str {
    let end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    &line[..end]
}

fn belongs_to(family: &str, sample: &str) -> bool {
    sample == family
        || sample
            .strip_prefix(family)
            .is_some_and(|suffix| matches!(suffix, "_bucket" | "_sum" | "_count"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_families_with_meta() {
        let text = "\
# HELP requests_total Total requests.
# TYPE requests_total counter
requests_total 3
other_metric{a=\"b\"} 1
";
        let families = parse_families(text);
        assert_eq!(families.len(), 2);
        assert_eq!(families["requests_total"].meta.len(), 2);
        assert_eq!(families["requests_total"].samples, vec!["requests_total 3"]);
        assert_eq!(families["other_metric"].samples, vec!["other_metric{a=\"b\"} 1"]);
        assert!(families["other_metric"].meta.is_empty());
    }

    #[test]
    fn histogram_samples_stay_in_their_family() {
        let text = "\
# TYPE latency_seconds histogram
latency_seconds_bucket{le=\"0.1\"} 4
latency_seconds_bucket{le=\"+Inf\"} 9
latency_seconds_sum 1.5
latency_seconds_count 9
";
        let families = parse_families(text);
        assert_eq!(families.len(), 1);
        assert_eq!(families["latency_seconds"].samples.len(), 4);
    }

    #[test]
    fn inject_label_without_existing_labels() {
        assert_eq!(
            inject_label("requests_total 3", "plugin", "p1"),
            "requests_total{plugin=\"p1\"} 3"
        );
    }

    #[test]
    fn inject_label_appends_to_existing_labels() {
        assert_eq!(
            inject_label("requests_total{method=\"GET\"} 3", "plugin", "p1"),
            "requests_total{method=\"GET\",plugin=\"p1\"} 3"
        );
    }

    #[test]
    fn inject_label_into_empty_brace_block() {
        assert_eq!(
            inject_label("requests_total{} 3", "plugin", "p1"),
            "requests_total{plugin=\"p1\"} 3"
        );
    }

    #[test]
    fn inject_label_keeps_timestamps() {
        assert_eq!(
            inject_label("requests_total 3 1700000000", "plugin", "p"),
            "requests_total{plugin=\"p\"} 3 1700000000"
        );
    }

    #[test]
    fn encode_is_sorted_by_family_name() {
        let text = "zeta 1\nalpha 2\nmiddle 3\n";
        let families = parse_families(text);
        let encoded = encode(&families);
        let names: Vec<&str> = encoded.lines().map(|l| l.split(' ').next().unwrap()).collect();
        assert_eq!(names, vec!["alpha", "middle", "zeta"]);
    }

    #[test]
    fn parse_then_encode_round_trips() {
        let text = "\
# HELP a A metric.
# TYPE a counter
a 1
b{x=\"y\"} 2
";
        let families = parse_families(text);
        assert_eq!(encode(&families), text);
    }
}
