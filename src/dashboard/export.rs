use crate::{
    core::{ErrorContext, ReliefResult},
    request::Request,
};

use super::FilterMode;

const HEADER: [&str; 7] = [
    "District",
    "Item",
    "Urgency",
    "Phone",
    "Latitude",
    "Longitude",
    "ExactGPS",
];

/// Download name for an export of the given view.
pub fn export_filename(filter: FilterMode) -> String {
    format!("relief_ops_{}.csv", filter.as_str())
}

/// Serialize approved requests to CSV. Never touches the store.
pub fn export_csv<'a, I>(requests: I) -> ReliefResult<Vec<u8>>
where
    I: IntoIterator<Item = &'a Request>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(HEADER)?;

    for request in requests {
        let coordinate = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();
        writer.write_record([
            request.district.as_str(),
            request.item.as_str(),
            request.urgency.as_str(),
            request.phone.as_deref().unwrap_or("N/A"),
            coordinate(request.lat).as_str(),
            coordinate(request.lng).as_str(),
            if request.has_exact_gps() { "Yes" } else { "No" },
        ])?;
    }

    writer
        .into_inner()
        .with_context("csv export failed")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        dashboard::DashboardView,
        request::{Coordinates, GpsFix, NewRequest, RequestPatch, Urgency},
    };

    fn approved(district: &str, item: &str, phone: Option<&str>, gps: Option<GpsFix>) -> Request {
        let req = Request::from_new(
            "id".to_string(),
            NewRequest {
                district: district.to_string(),
                item: item.to_string(),
                phone: phone.map(str::to_string),
                urgency: Urgency::Critical,
                gps,
                timestamp: Utc::now(),
            },
        );
        let location = gps.map(Coordinates::from).unwrap_or(Coordinates::new(6.05, 80.22));
        RequestPatch::approve(location).apply(&req).unwrap()
    }

    #[test]
    fn test_export_filename() {
        assert_eq!(export_filename(FilterMode::All), "relief_ops_ALL.csv");
        assert_eq!(export_filename(FilterMode::Medical), "relief_ops_MEDICAL.csv");
    }

    #[test]
    fn test_export_rows() {
        let requests = vec![
            approved("Galle", "Water", None, None),
            approved(
                "Kandy",
                "Rice, lentils",
                Some("0771234567"),
                Some(GpsFix { lat: 7.29, lng: 80.63 }),
            ),
        ];
        let csv = String::from_utf8(export_csv(&requests).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(
            lines[0],
            "District,Item,Urgency,Phone,Latitude,Longitude,ExactGPS"
        );
        assert_eq!(lines[1], "Galle,Water,Critical,N/A,6.05,80.22,No");
        assert_eq!(
            lines[2],
            "Kandy,\"Rice, lentils\",Critical,0771234567,7.29,80.63,Yes"
        );
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_export_filtered_view() {
        let requests = vec![
            approved("Galle", "Water", None, None),
            approved("Matara", "Rice", None, None),
        ];
        let view = DashboardView::derive(&requests, FilterMode::Water);
        let csv = String::from_utf8(export_csv(view.visible_requests()).unwrap()).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.contains("Galle"));
        assert!(!csv.contains("Matara"));
    }

    #[test]
    fn test_export_empty_view_has_header() {
        let csv = export_csv(std::iter::empty()).unwrap();
        assert_eq!(
            String::from_utf8(csv).unwrap(),
            "District,Item,Urgency,Phone,Latitude,Longitude,ExactGPS\n"
        );
    }
}
