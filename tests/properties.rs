use facerec::search::{KnnSearch, Search};
use facerec::{face_distance, face_distances, FaceEncoding, ENCODING_DIM};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);
    ProptestConfig::with_cases(cases)
}

fn arb_encoding() -> impl Strategy<Value = FaceEncoding> {
    vec(-1.0f64..1.0, ENCODING_DIM).prop_map(|values| FaceEncoding::from_slice(&values).expect("128 values"))
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn distance_to_self_is_zero(e in arb_encoding()) {
        prop_assert_eq!(face_distance(&e, &e), 0.0);
    }

    #[test]
    fn distance_is_symmetric(a in arb_encoding(), b in arb_encoding()) {
        prop_assert_eq!(face_distance(&a, &b), face_distance(&b, &a));
        prop_assert!(face_distance(&a, &b) >= 0.0);
    }

    #[test]
    fn json_round_trip_is_exact(e in arb_encoding()) {
        let json = e.to_json().expect("serialize encoding");
        let restored = FaceEncoding::from_json(&json).expect("parse encoding");
        prop_assert_eq!(face_distance(&e, &restored), 0.0);
        prop_assert_eq!(e, restored);
    }

    #[test]
    fn bytes_round_trip_is_exact(e in arb_encoding()) {
        let restored = FaceEncoding::from_bytes(&e.to_bytes()).expect("decode encoding");
        prop_assert_eq!(e, restored);
    }

    #[test]
    fn exact_search_is_sorted_subset(
        gallery in vec(arb_encoding(), 0..24),
        query in arb_encoding(),
        k in 0usize..30,
    ) {
        let mut index = KnnSearch::new();
        for (label, encoding) in gallery.iter().enumerate() {
            index.add(label as i32, encoding).expect("add");
        }
        index.build().expect("build");

        let hits = index.query(&query, k).expect("query");
        prop_assert_eq!(hits.len(), k.min(gallery.len()));
        prop_assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        for hit in &hits {
            let stored = &gallery[hit.label as usize];
            prop_assert_eq!(hit.distance, face_distance(stored, &query));
        }
    }

    #[test]
    fn exact_search_top_one_is_global_minimum(
        gallery in vec(arb_encoding(), 1..24),
        query in arb_encoding(),
    ) {
        let mut index = KnnSearch::new();
        for (label, encoding) in gallery.iter().enumerate() {
            index.add(label as i32, encoding).expect("add");
        }
        index.build().expect("build");

        let best = index.query(&query, 1).expect("query");
        let minimum = face_distances(&gallery, &query)
            .into_iter()
            .fold(f64::INFINITY, f64::min);
        prop_assert_eq!(best.len(), 1);
        prop_assert_eq!(best[0].distance, minimum);
    }
}

#[test]
fn empty_encoding_is_zero_distance_to_anything() {
    let e = FaceEncoding::from_slice(&[0.5; ENCODING_DIM]).unwrap();
    assert_eq!(face_distance(&FaceEncoding::empty(), &e), 0.0);
    assert_eq!(face_distance(&e, &FaceEncoding::empty()), 0.0);
}
