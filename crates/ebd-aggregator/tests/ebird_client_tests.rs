//! eBird reference client against a mock API

mod common;

use anyhow::Result;
use ebd_aggregator::reference::{
    fetch_reference, load_reference, EbirdClient, EbirdClientConfig, ReferencePaths,
};
use ebd_aggregator::PipelineError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> EbirdClient {
    let config = EbirdClientConfig::default()
        .with_base_url(server.uri())
        .with_api_key("test-key")
        .with_hotspot_delay(Duration::ZERO)
        .with_max_retries(2);
    EbirdClient::new(config).unwrap()
}

fn taxonomy() -> serde_json::Value {
    json!([
        {"sciName": "Beta beta", "comName": "Beta", "speciesCode": "beta1", "taxonOrder": 20.0, "category": "species"},
        {"sciName": "Alpha alpha", "comName": "Alpha", "speciesCode": "alpha1", "taxonOrder": 10.0, "category": "species"},
        {"sciName": "Alpha sp.", "comName": "alpha sp.", "speciesCode": "alpha", "taxonOrder": 11.0, "category": "spuh"}
    ])
}

fn hotspot(id: &str, name: &str, country: &str, sub1: &str) -> serde_json::Value {
    json!({
        "locId": id,
        "locName": name,
        "countryCode": country,
        "subnational1Code": sub1,
        "subnational2Code": "",
        "lat": 10.5,
        "lng": -20.25,
        "numSpeciesAllTime": 120
    })
}

async fn mount_reference(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/ref/taxonomy/ebird"))
        .and(header("X-eBirdApiToken", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(taxonomy()))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/ref/region/list/country/world"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"code": "AA", "name": "Alphaland"},
            {"code": "BB", "name": "Betaland"},
            {"code": "CC", "name": "Gammaland"}
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/ref/hotspot/AA"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            hotspot("L2", "Second Pond", "AA", "AA-01"),
            hotspot("L1", "First Pond", "AA", "AA-"),
            hotspot("L9", "Stakeout Rare Gull", "AA", "AA-01")
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/ref/region/list/subnational1/AA"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"code": "AA-01", "name": "First Province"}
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/ref/region/list/subnational2/AA"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"code": "AA-01-001", "name": "North District"}
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/ref/hotspot/BB"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/ref/hotspot/CC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            hotspot("L3", "Reservoir", "CC", "CC-NW")
        ])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_fetch_reference_writes_loadable_files() -> Result<()> {
    common::init_tracing();
    let server = MockServer::start().await;
    mount_reference(&server).await;

    let dir = tempfile::tempdir()?;
    let paths = ReferencePaths::in_dir(&dir.path().join("reference"));

    let summary = fetch_reference(&client(&server), &paths).await?;
    assert_eq!(summary.species, 2);
    assert_eq!(summary.hotspots, 3);
    assert_eq!(summary.failed_countries, 1);
    // Three countries plus the AA province and district
    assert_eq!(summary.regions, 5);

    let reference = load_reference(&paths)?;
    assert_eq!(reference.species_id("Alpha alpha"), Some(1));
    assert_eq!(reference.species_id("Beta beta"), Some(2));
    assert_eq!(reference.species_id("Alpha sp."), None);

    let ids: Vec<&str> = reference.hotspots().iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, ["L1", "L2", "L3"]);
    let l2 = reference.hotspot("L2").expect("L2");
    assert_eq!(l2.subnational2_code, None);
    assert_eq!(l2.num_species, Some(120));
    assert!(!reference.has_hotspot("L9"));
    Ok(())
}

#[tokio::test]
async fn test_region_names_survive_missing_lists() -> Result<()> {
    let server = MockServer::start().await;
    mount_reference(&server).await;

    let dir = tempfile::tempdir()?;
    let paths = ReferencePaths::in_dir(dir.path());
    fetch_reference(&client(&server), &paths).await?;
    let reference = load_reference(&paths)?;

    assert_eq!(reference.region_name("AA"), Some("Alphaland"));
    assert_eq!(reference.region_name("AA-01"), Some("First Province"));
    assert_eq!(reference.region_name("AA-01-001"), Some("North District"));
    // CC has no subregion lists mounted; BB failed but keeps its country name
    assert_eq!(reference.region_name("CC"), Some("Gammaland"));
    assert_eq!(reference.region_name("CC-NW"), None);
    assert_eq!(reference.region_name("BB"), Some("Betaland"));
    Ok(())
}

#[tokio::test]
async fn test_server_errors_are_retried() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/ref/region/list/country/world"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/ref/region/list/country/world"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"code": "AA", "name": "Alphaland"}
        ])))
        .mount(&server)
        .await;

    let countries = client(&server).fetch_countries().await?;
    assert_eq!(countries.len(), 1);
    assert_eq!(countries[0].code, "AA");
    Ok(())
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/ref/taxonomy/ebird"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).fetch_taxonomy().await.unwrap_err();
    assert!(matches!(err, PipelineError::Api { status: 403, .. }));
}

#[tokio::test]
async fn test_empty_taxonomy_writes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/ref/taxonomy/ebird"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let paths = ReferencePaths::in_dir(dir.path());
    let err = fetch_reference(&client(&server), &paths).await.unwrap_err();

    assert!(matches!(err, PipelineError::MissingReference(_)));
    assert!(paths.files().iter().all(|p| !p.exists()));
}
