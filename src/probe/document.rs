use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

// ─── Name pools ──────────────────────────────────────────────────

static FIRST: &[&str] = &[
    "Emma", "Liam", "Olivia", "Noah", "Ava", "Ethan", "Sophia", "Mason", "Mia", "James",
];

static CITY: &[&str] = &[
    "Lisbon", "Osaka", "Denver", "Nairobi", "Tallinn", "Quito", "Perth", "Oslo",
];

static CATEGORY: &[&str] = &["alpha", "beta", "gamma", "delta"];

/// Body written under a probe key. Field values carry no meaning; only the
/// key matters to the observer. `body` pads the record to the configured size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeDocument {
    pub name: String,
    pub email: String,
    pub city: String,
    pub category: String,
    pub counter: u64,
    pub body: String,
}

impl ProbeDocument {
    /// `seq` seeds the generator, so the same sequence number yields the
    /// same document.
    pub fn generate(seq: u64, payload_size: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seq);
        let first = FIRST[rng.gen_range(0..FIRST.len())];
        let body: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(payload_size)
            .map(char::from)
            .collect();
        Self {
            name: format!("{first} {seq}"),
            email: format!("{}{seq}@example.com", first.to_lowercase()),
            city: CITY[rng.gen_range(0..CITY.len())].to_owned(),
            category: CATEGORY[rng.gen_range(0..CATEGORY.len())].to_owned(),
            counter: seq,
            body,
        }
    }

    /// Flat field/value pairs for hash-style stores.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("email", self.email.clone()),
            ("city", self.city.clone()),
            ("category", self.category.clone()),
            ("counter", self.counter.to_string()),
            ("body", self.body.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_per_sequence() {
        let a = ProbeDocument::generate(7, 64);
        let b = ProbeDocument::generate(7, 64);
        assert_eq!(a, b);
        assert_eq!(a.body.len(), 64);
        assert_ne!(a, ProbeDocument::generate(8, 64));
    }

    #[test]
    fn fields_cover_every_attribute() {
        let doc = ProbeDocument::generate(1, 16);
        let fields = doc.fields();
        assert_eq!(fields.len(), 6);
        assert!(fields.iter().any(|(k, v)| *k == "counter" && v == "1"));
    }
}
