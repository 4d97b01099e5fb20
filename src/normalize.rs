use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::osm::{GeocodedAddress, Pacer, RawElement, ReverseGeocode, ShopTags};

const DEFAULT_DESCRIPTION: &str = "Motorcycle repair shop from OpenStreetMap";

/// Canonical listing shape as handed to the store. `id` and the timestamps
/// are store-owned and never appear here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewShop {
    pub name: String,
    pub description: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub country_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<String>,
    pub services: Vec<String>,
    pub verified: bool,
    pub rating: Option<f64>,
    pub review_count: i64,
    pub osm_id: String,
    pub osm_type: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressFields {
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

/// Maps a raw provider element to the canonical listing. Geocoding is only
/// spent when the inline city tag is missing or the record has never been
/// seen by the store; the pacer spaces those lookups.
pub async fn normalize(
    raw: &RawElement,
    region_code: &str,
    known_to_store: bool,
    geocoder: &dyn ReverseGeocode,
    geocode_pacer: &Pacer,
) -> AppResult<NewShop> {
    let (lat, lon) = raw
        .coordinate()
        .ok_or_else(|| AppError::MissingCoordinate(raw.external_id()))?;

    let geocoded = if raw.tags.city.is_none() || !known_to_store {
        geocode_pacer.wait().await;
        geocoder.reverse(lat, lon).await
    } else {
        None
    };

    let address = format_address(&raw.tags, geocoded.as_ref());
    let (phone, email, website) = contact_info(&raw.tags);

    Ok(NewShop {
        name: display_name(raw),
        description: Some(DEFAULT_DESCRIPTION.to_string()),
        street_address: address.street_address,
        postal_code: address.postal_code,
        city: address.city,
        country: address.country,
        country_code: region_code.to_string(),
        latitude: Some(lat),
        longitude: Some(lon),
        phone,
        email,
        website,
        opening_hours: raw.tags.opening_hours.clone(),
        services: extract_services(&raw.tags),
        verified: false,
        rating: None,
        review_count: 0,
        osm_id: raw.external_id(),
        osm_type: raw.kind.as_str().to_string(),
    })
}

fn display_name(raw: &RawElement) -> String {
    raw.tags
        .name
        .clone()
        .unwrap_or_else(|| format!("Motorcycle Shop {}", raw.id))
}

/// Inline tags win; geocoded fields only fill still-missing pieces.
pub fn format_address(tags: &ShopTags, geocoded: Option<&GeocodedAddress>) -> AddressFields {
    let fallback = GeocodedAddress::default();
    let geo = geocoded.unwrap_or(&fallback);

    let street = tags.street.as_deref().or(geo.road.as_deref());
    let house_number = tags.house_number.as_deref().or(geo.house_number.as_deref());
    let street_address = street.map(|street| match house_number {
        Some(number) => format!("{street} {number}"),
        None => street.to_string(),
    });

    AddressFields {
        street_address,
        postal_code: tags
            .postcode
            .clone()
            .or_else(|| geo.postcode.clone()),
        city: tags
            .city
            .clone()
            .or_else(|| geo.resolved_city().map(str::to_string)),
        country: tags.country.clone().or_else(|| geo.country.clone()),
    }
}

/// Bare tags take precedence over their `contact:*` equivalents.
pub fn contact_info(tags: &ShopTags) -> (Option<String>, Option<String>, Option<String>) {
    (
        tags.phone.clone().or_else(|| tags.contact_phone.clone()),
        tags.email.clone().or_else(|| tags.contact_email.clone()),
        tags.website.clone().or_else(|| tags.contact_website.clone()),
    )
}

/// Every listing offers repair; recognized boolean flags append one
/// human-readable label each, unrecognized flags are ignored.
pub fn extract_services(tags: &ShopTags) -> Vec<String> {
    let flags: [(&Option<String>, &str); 6] = [
        (&tags.service_repair, "Service"),
        (&tags.service_tyres, "Tyre Change"),
        (&tags.service_oil_change, "Oil Change"),
        (&tags.service_parts, "Parts"),
        (&tags.service_inspection, "Inspection"),
        (&tags.service_maintenance, "Maintenance"),
    ];

    let mut services = vec!["Repair".to_string()];
    for (flag, label) in flags {
        if flag.as_deref() == Some("yes") {
            services.push(label.to_string());
        }
    }
    services
}
