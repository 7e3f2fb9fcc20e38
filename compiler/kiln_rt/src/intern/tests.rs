use pretty_assertions::assert_eq;

use super::*;
use crate::namespace::Namespace;

#[test]
fn interning_is_idempotent() {
    let a = Name::new("append");
    let b = Name::new("append");
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "append");
}

#[test]
fn empty_string_is_preinterned() {
    assert_eq!(Name::new(""), Name::EMPTY);
}

#[test]
fn concurrent_interning_agrees() {
    let names: Vec<Vec<Name>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| (0..64).map(|i| Name::new(&format!("n{i}"))).collect()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .collect()
    });
    for other in &names[1..] {
        assert_eq!(&names[0], other);
    }
}

#[test]
fn default_name_is_empty() {
    assert_eq!(Name::default(), Name::EMPTY);
    assert_eq!(Name::default().as_str(), "");
    assert_eq!(Namespace::default().name, Name::EMPTY);
}
