use assert_matches::assert_matches;
use kira_run_fetch::domain::{CloudProvider, RunId};
use kira_run_fetch::error::FetchError;
use kira_run_fetch::location::{
    BucketClass, ContainerQuality, Location, ObjectAddress, ObjectQuery, parse_ena_filereport,
    parse_run_accessions, parse_sdl_locations,
};

const SDL_ODP: &str = r#"{
  "version": "2",
  "result": [{
    "bundle": "SRR12118866",
    "status": 200,
    "files": [
      {
        "object": "srapub_files|SRR12118866",
        "type": "sra",
        "name": "SRR12118866",
        "size": 123456,
        "md5": "4fa3a7cd9b0d7f4f6b3cdd0e4b1c6a52",
        "locations": [
          {"service": "s3", "region": "us-east-1",
           "link": "https://sra-pub-run-odp.s3.amazonaws.com/sra/SRR12118866/SRR12118866"},
          {"service": "s3", "region": "us-east-1", "payRequired": true,
           "bucket": "sra-pub-src-1", "key": "SRR12118866/run.bam",
           "link": "https://sra-pub-src-1.s3.amazonaws.com/SRR12118866/run.bam"},
          {"service": "gs", "region": "us-east1", "payRequired": true,
           "link": "https://storage.googleapis.com/sra-pub-run-1/SRR12118866/SRR12118866.1"}
        ]
      },
      {
        "type": "sra",
        "name": "SRR12118866.noqual",
        "md5": "0b0b4d57a2e2bd1a3c4f6d1dc4b7d1a0",
        "locations": [
          {"service": "s3",
           "link": "https://sra-pub-run-odp.s3.amazonaws.com/sra/SRR12118866/SRR12118866.noqual"}
        ]
      }
    ]
  }]
}"#;

fn run() -> RunId {
    "SRR12118866".parse().unwrap()
}

fn query(provider: CloudProvider, allow_paid: bool) -> ObjectQuery {
    ObjectQuery {
        provider,
        quality: ContainerQuality::Full,
        allow_paid,
    }
}

fn object_stores(locations: Vec<Location>) -> Vec<kira_run_fetch::location::ObjectStoreLocation> {
    locations
        .into_iter()
        .map(|location| match location {
            Location::ObjectStore(loc) => loc,
            other => panic!("unexpected location {other:?}"),
        })
        .collect()
}

#[test]
fn open_data_location_only_without_paid() {
    let locations = parse_sdl_locations(SDL_ODP, &run(), &query(CloudProvider::Aws, false)).unwrap();
    let locations = object_stores(locations);
    assert_eq!(locations.len(), 1);
    let odp = &locations[0];
    assert_eq!(odp.class, BucketClass::OpenData);
    assert_eq!(
        odp.bucket_or_path,
        ObjectAddress::Uri("s3://sra-pub-run-odp/sra/SRR12118866/SRR12118866".to_string())
    );
    assert_eq!(
        odp.checksum.as_ref().map(|c| c.as_str()),
        Some("4fa3a7cd9b0d7f4f6b3cdd0e4b1c6a52")
    );
}

#[test]
fn paid_location_included_when_allowed() {
    let locations = parse_sdl_locations(SDL_ODP, &run(), &query(CloudProvider::Aws, true)).unwrap();
    let locations = object_stores(locations);
    assert_eq!(locations.len(), 2);
    let paid = &locations[1];
    assert!(paid.requires_payment);
    assert!(paid.is_paid());
    assert_eq!(paid.class, BucketClass::RequesterPays);
    assert_eq!(paid.copy_uri().unwrap(), "s3://sra-pub-src-1/SRR12118866/run.bam");
}

#[test]
fn gcp_link_becomes_gs_uri() {
    let locations = parse_sdl_locations(SDL_ODP, &run(), &query(CloudProvider::Gcp, true)).unwrap();
    let locations = object_stores(locations);
    assert_eq!(locations.len(), 1);
    assert_eq!(
        locations[0].copy_uri().unwrap(),
        "gs://sra-pub-run-1/SRR12118866/SRR12118866.1"
    );

    let unpaid = parse_sdl_locations(SDL_ODP, &run(), &query(CloudProvider::Gcp, false)).unwrap();
    assert!(unpaid.is_empty());
}

#[test]
fn noqual_container_only_when_asked_for() {
    let noqual = ObjectQuery {
        provider: CloudProvider::Aws,
        quality: ContainerQuality::NoQual,
        allow_paid: false,
    };
    let locations = object_stores(parse_sdl_locations(SDL_ODP, &run(), &noqual).unwrap());
    assert_eq!(locations.len(), 1);
    assert_eq!(
        locations[0].link.as_deref(),
        Some("https://sra-pub-run-odp.s3.amazonaws.com/sra/SRR12118866/SRR12118866.noqual")
    );
}

#[test]
fn rehydration_required_cannot_be_copied() {
    let body = r#"{"version":"2","result":[{"files":[{"type":"sra","name":"SRR1","locations":[
        {"service":"gs","rehydrationRequired":true,"bucket":"b","key":"k"}]}]}]}"#;
    let run: RunId = "SRR1".parse().unwrap();
    let locations = object_stores(
        parse_sdl_locations(body, &run, &query(CloudProvider::Gcp, false)).unwrap(),
    );
    assert_eq!(locations.len(), 1);
    assert_matches!(locations[0].copy_uri(), Err(FetchError::TransferFailed(_)));
}

#[test]
fn requester_pays_without_key_is_unaddressable() {
    let body = r#"{"version":"2","result":[{"files":[{"type":"sra","name":"SRR1","locations":[
        {"service":"s3","link":"https://some-other-bucket.s3.amazonaws.com/SRR1"}]}]}]}"#;
    let run: RunId = "SRR1".parse().unwrap();
    let locations = object_stores(
        parse_sdl_locations(body, &run, &query(CloudProvider::Aws, true)).unwrap(),
    );
    assert_eq!(locations.len(), 1);
    assert_matches!(locations[0].bucket_or_path, ObjectAddress::Unavailable(_));
}

#[test]
fn no_files_is_empty_not_error() {
    let body = r#"{"version":"2","result":[{"bundle":"SRR1","status":404,"msg":"No data at given location.run"}]}"#;
    let run: RunId = "SRR1".parse().unwrap();
    let locations = parse_sdl_locations(body, &run, &query(CloudProvider::Aws, false)).unwrap();
    assert!(locations.is_empty());
}

#[test]
fn wrong_version_is_resolution_error() {
    let body = r#"{"version":"3","result":[{"files":[]}]}"#;
    let run: RunId = "SRR1".parse().unwrap();
    let err = parse_sdl_locations(body, &run, &query(CloudProvider::Aws, false)).unwrap_err();
    assert_matches!(err, FetchError::Resolution(_));
}

#[test]
fn malformed_json_is_resolution_error() {
    let run: RunId = "SRR1".parse().unwrap();
    let err = parse_sdl_locations("<html>oops</html>", &run, &query(CloudProvider::Aws, false))
        .unwrap_err();
    assert_matches!(err, FetchError::Resolution(_));
}

#[test]
fn malformed_checksum_is_resolution_error() {
    let body = r#"{"version":"2","result":[{"files":[{"type":"sra","name":"SRR1","md5":"XYZ",
        "locations":[{"service":"s3","link":"https://sra-pub-run-odp.s3.amazonaws.com/sra/SRR1/SRR1"}]}]}]}"#;
    let run: RunId = "SRR1".parse().unwrap();
    let err = parse_sdl_locations(body, &run, &query(CloudProvider::Aws, false)).unwrap_err();
    assert_matches!(err, FetchError::Resolution(_));
}

#[test]
fn ena_paired_row() {
    let body = "run_accession\tfastq_ftp\tfastq_md5\n\
SRR12118866\tftp.sra.ebi.ac.uk/vol1/fastq/SRR121/066/SRR12118866/SRR12118866_1.fastq.gz;ftp.sra.ebi.ac.uk/vol1/fastq/SRR121/066/SRR12118866/SRR12118866_2.fastq.gz\t\
9cf2e7ec5e6e5ab2c10b3e9b21b1b1d4;0ad2f4a3c3be2e6f1e1bd8f1d54bd2d8\n";
    let locations = parse_ena_filereport(body, &run()).unwrap();
    assert_eq!(locations.len(), 2);
    match &locations[1] {
        Location::BulkFtp(loc) => {
            assert_eq!(loc.file_name(), "SRR12118866_2.fastq.gz");
            assert_eq!(
                loc.checksum.as_ref().map(|c| c.as_str()),
                Some("0ad2f4a3c3be2e6f1e1bd8f1d54bd2d8")
            );
        }
        other => panic!("unexpected location {other:?}"),
    }
}

#[test]
fn ena_zero_rows_and_empty_field_mean_no_locations() {
    let header_only = "run_accession\tfastq_ftp\tfastq_md5\n";
    assert!(parse_ena_filereport(header_only, &run()).unwrap().is_empty());

    let empty_field = "run_accession\tfastq_ftp\tfastq_md5\nSRR12118866\t\t\n";
    assert!(parse_ena_filereport(empty_field, &run()).unwrap().is_empty());

    assert!(parse_ena_filereport("", &run()).unwrap().is_empty());
}

#[test]
fn ena_missing_column_is_resolution_error() {
    let body = "run_accession\tsubmitted_ftp\nSRR12118866\tx\n";
    assert_matches!(
        parse_ena_filereport(body, &run()),
        Err(FetchError::Resolution(_))
    );
}

#[test]
fn ena_multiple_rows_is_resolution_error() {
    let body = "run_accession\tfastq_ftp\tfastq_md5\nSRR1\ta\t\nSRR2\tb\t\n";
    assert_matches!(
        parse_ena_filereport(body, &run()),
        Err(FetchError::Resolution(_))
    );
}

#[test]
fn bioproject_run_list() {
    let body = "run_accession\nSRR1001\nSRR1002\n\n";
    let runs = parse_run_accessions(body).unwrap();
    let names: Vec<&str> = runs.iter().map(RunId::as_str).collect();
    assert_eq!(names, vec!["SRR1001", "SRR1002"]);
    assert!(parse_run_accessions("run_accession\n").unwrap().is_empty());
}
