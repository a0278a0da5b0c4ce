use crate::types::{RawListing, WatchDefinition};

/// Why a listing was dropped by the local filters. Purely informational —
/// filtered listings are never marked seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRejection {
    PriceAboveMax,
    PriceBelowMin,
    SellerRating,
    SellerFeedback,
}

/// Apply the watch's numeric filters to a listing. `comparable_price` is the
/// listing price expressed in the watch's currency when conversion succeeded,
/// or the raw amount when it did not (degrade, don't drop).
pub fn check_listing(
    watch: &WatchDefinition,
    listing: &RawListing,
    comparable_price: f64,
) -> Result<(), FilterRejection> {
    check_price(watch, comparable_price)?;
    check_seller(watch, listing)
}

pub fn check_price(watch: &WatchDefinition, comparable_price: f64) -> Result<(), FilterRejection> {
    if comparable_price > watch.max_price {
        return Err(FilterRejection::PriceAboveMax);
    }
    if let Some(min) = watch.min_price {
        if comparable_price < min {
            return Err(FilterRejection::PriceBelowMin);
        }
    }
    Ok(())
}

pub fn check_seller(watch: &WatchDefinition, listing: &RawListing) -> Result<(), FilterRejection> {
    if let Some(floor) = watch.min_seller_rating {
        match listing.seller_rating {
            Some(rating) if rating >= floor => {}
            _ => return Err(FilterRejection::SellerRating),
        }
    }
    if let Some(floor) = watch.min_seller_feedback {
        match listing.seller_feedback_count {
            Some(count) if count >= floor => {}
            _ => return Err(FilterRejection::SellerFeedback),
        }
    }
    Ok(())
}

/// A listing must carry a usable id and a finite positive price to be
/// processed at all. Malformed listings are skipped, not escalated.
pub fn is_valid(listing: &RawListing) -> bool {
    !listing.listing_id.is_empty()
        && listing.price_amount.is_finite()
        && listing.price_amount > 0.0
}
