use crate::alerts::types::Subscription;

/// Whether any threshold can lie strictly between the two prices on a rising edge.
pub fn may_cross(previous_price: Option<f64>, current_price: f64) -> bool {
    matches!(previous_price, Some(previous) if previous < current_price)
}

pub fn is_crossing(previous_price: f64, current_price: f64, threshold: f64) -> bool {
    previous_price < threshold && threshold < current_price
}

/// Subscriptions whose threshold the price rose through between two consecutive ticks.
///
/// Only the rising edge counts: a falling or flat price, or a symbol with no previous
/// observation, yields nothing. A wide gap between ticks fires every threshold inside it
/// exactly once.
pub fn detect_crossings<'a>(
    previous_price: Option<f64>,
    current_price: f64,
    subscriptions: &'a [Subscription],
) -> Vec<&'a Subscription> {
    let Some(previous) = previous_price else {
        return Vec::new();
    };
    if !may_cross(previous_price, current_price) {
        return Vec::new();
    }

    subscriptions
        .iter()
        .filter(|subscription| is_crossing(previous, current_price, subscription.price_threshold))
        .collect()
}
