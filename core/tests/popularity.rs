//! Popularity weighting: rank concentration, new-item boost, ties.

use chrono::{Days, NaiveDate};
use rental_sim_core::{
    config::PopularityConfig,
    popularity::PopularityWeighter,
    rng::SubsystemRng,
    store::CatalogPopularityRow,
};

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

fn long_ago() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

/// `n` old items whose rental counts fall with id.
fn ranked_catalog(n: i64) -> Vec<CatalogPopularityRow> {
    (1..=n)
        .map(|id| CatalogPopularityRow {
            catalog_item_id: id,
            rental_count:    (n - id + 1) as u64 * 10,
            introduced_on:   long_ago(),
        })
        .collect()
}

fn weighter(alpha: f64) -> PopularityWeighter {
    PopularityWeighter::new(&PopularityConfig { alpha, ..PopularityConfig::default() })
}

/// Top-20% mass of a 100-item Zipf catalog: H(20, alpha) / H(100, alpha).
const ZIPF_TOP_FIFTH_OF_100: [(f64, f64); 3] = [(0.8, 0.5791), (1.0, 0.6936), (1.2, 0.7934)];

#[test]
fn top_fifth_share_matches_zipf_for_alpha_range() {
    let items = ranked_catalog(100);
    for (alpha, reference) in ZIPF_TOP_FIFTH_OF_100 {
        let share = weighter(alpha).weigh(&items, as_of()).top_share(0.2);
        assert!(
            (share - reference).abs() < 0.001,
            "alpha={alpha}: top 20% share {share:.4}, Zipf reference {reference:.4}"
        );
        assert!(
            (0.5..=0.8).contains(&share),
            "alpha={alpha}: top 20% share {share:.4} outside the 50-80% band"
        );
    }
}

#[test]
fn small_catalog_at_alpha_one_gives_the_top_fifth_about_half() {
    // Ten titles: the top two carry 51.2% of the mass. Larger catalogs
    // concentrate further (69% at 100 titles).
    let share = weighter(1.0).weigh(&ranked_catalog(10), as_of()).top_share(0.2);
    assert!((0.45..=0.55).contains(&share), "top 20% share {share:.4} outside 45-55%");
    assert!((share - 0.5121).abs() < 0.001);
}

#[test]
fn distribution_is_normalized_and_every_item_reachable() {
    let dist = weighter(1.0).weigh(&ranked_catalog(50), as_of());
    let total: f64 = dist.entries().iter().map(|e| e.probability).sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert!(dist.entries().iter().all(|e| e.probability > 0.0), "some item can never be chosen");
    assert_eq!(dist.entries()[0].catalog_item_id, 1, "most rented item should rank first");
}

#[test]
fn boost_decays_linearly_to_one() {
    let w = weighter(1.0);
    assert_eq!(w.boost_multiplier(0), 2.0);
    assert!((w.boost_multiplier(45) - 1.5).abs() < 1e-9);
    assert_eq!(w.boost_multiplier(90), 1.0);
    assert_eq!(w.boost_multiplier(400), 1.0);

    let mut previous = f64::INFINITY;
    for day in 0..=90 {
        let m = w.boost_multiplier(day);
        assert!(m <= previous, "boost rose at day {day}");
        previous = m;
    }
}

#[test]
fn new_item_outweighs_an_equally_ranked_old_one() {
    let fresh = as_of() - Days::new(30);
    let items = vec![
        CatalogPopularityRow { catalog_item_id: 1, rental_count: 0, introduced_on: long_ago() },
        CatalogPopularityRow { catalog_item_id: 2, rental_count: 0, introduced_on: fresh },
    ];
    let w = PopularityWeighter::new(&PopularityConfig {
        alpha: 1.0,
        new_item_boost_factor: 3.0,
        ..PopularityConfig::default()
    });
    let dist = w.weigh(&items, as_of());

    // Rank 1 weighs half of rank 0, then the boost applies.
    let ratio = dist.probability(2) / dist.probability(1);
    assert!((ratio - 0.5 * w.boost_multiplier(30)).abs() < 1e-9, "ratio {ratio}");
    assert!(dist.probability(2) > dist.probability(1));
}

#[test]
fn unreleased_items_are_not_weighted() {
    let mut items = ranked_catalog(3);
    items[0].introduced_on = as_of() + Days::new(1);
    let dist = weighter(1.0).weigh(&items, as_of());
    assert_eq!(dist.len(), 2);
    assert_eq!(dist.probability(1), 0.0);
}

#[test]
fn zero_count_ties_rank_the_same_regardless_of_input_order() {
    let mut items: Vec<_> = (1..=6)
        .map(|id| CatalogPopularityRow { catalog_item_id: id, rental_count: 0, introduced_on: long_ago() })
        .collect();
    let a = weighter(1.0).weigh(&items, as_of());
    items.reverse();
    let b = weighter(1.0).weigh(&items, as_of());

    let order = |d: &rental_sim_core::popularity::PopularityDistribution| {
        d.entries().iter().map(|e| e.catalog_item_id).collect::<Vec<_>>()
    };
    assert_eq!(order(&a), order(&b));
    assert_eq!(order(&a), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn draws_follow_the_weights() {
    let dist = weighter(1.0).weigh(&ranked_catalog(10), as_of());
    let mut rng = SubsystemRng::new(2024, 0);
    const DRAWS: usize = 20_000;

    let mut top = 0;
    for _ in 0..DRAWS {
        if dist.sample(&mut rng) == Some(1) {
            top += 1;
        }
    }
    let observed = top as f64 / DRAWS as f64;
    let expected = dist.probability(1);
    assert!(
        (observed - expected).abs() < 0.02,
        "top item drawn {observed:.3} of the time, weight {expected:.3}"
    );
}
