//! Aggregated server statistics.

use std::collections::BTreeMap;

/// One server's value for a statistic.
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
    Text(String),
    /// The server did not report the statistic, or was not queried.
    Absent,
}

impl StatValue {
    pub fn parse(raw: &str) -> Self {
        if let Ok(v) = raw.parse::<i64>() {
            StatValue::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            StatValue::Float(v)
        } else {
            StatValue::Text(raw.to_string())
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Statistics from every server in the pool.
///
/// Each statistic maps to one value per server, in pool order, so the values
/// line up with [`Stats::servers`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stats {
    servers: Vec<String>,
    values: BTreeMap<String, Vec<StatValue>>,
}

impl Stats {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            values: BTreeMap::new(),
        }
    }

    /// Record the statistics reported by the server at `index`.
    pub fn record(&mut self, index: usize, reported: &[(String, String)]) {
        let width = self.servers.len();
        for (name, raw) in reported {
            let column = self
                .values
                .entry(name.clone())
                .or_insert_with(|| vec![StatValue::Absent; width]);
            if let Some(slot) = column.get_mut(index) {
                *slot = StatValue::parse(raw);
            }
        }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Per-server values for `name`.
    pub fn get(&self, name: &str) -> Option<&[StatValue]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn values_align_with_servers() {
        let mut stats = Stats::new(vec!["a:1".into(), "b:1".into(), "c:1".into()]);
        stats.record(0, &pairs(&[("pid", "10"), ("version", "1.6.21")]));
        stats.record(2, &pairs(&[("pid", "30"), ("rusage_user", "0.25")]));

        assert_eq!(
            stats.get("pid").unwrap(),
            &[StatValue::Int(10), StatValue::Absent, StatValue::Int(30)]
        );
        assert_eq!(
            stats.get("version").unwrap(),
            &[
                StatValue::Text("1.6.21".into()),
                StatValue::Absent,
                StatValue::Absent
            ]
        );
        assert_eq!(stats.get("rusage_user").unwrap()[2], StatValue::Float(0.25));
        assert_eq!(stats.names().collect::<Vec<_>>(), ["pid", "rusage_user", "version"]);
        assert!(stats.get("missing").is_none());
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let mut stats = Stats::new(vec!["a:1".into()]);
        stats.record(4, &pairs(&[("pid", "1")]));
        assert_eq!(stats.get("pid").unwrap(), &[StatValue::Absent]);
    }
}
