use serde::Deserialize;

use stevedore_core::UploadSettings;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub objects: stevedore_objectstore::Config,
    #[serde(default)]
    pub upload: UploadSettings,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upload_section_is_optional() {
        let config: Config = serde_yaml::from_str(
            r#"
objects:
  type: Memory
  bucket_name: scratch
"#,
        )
        .unwrap();
        assert!(matches!(
            config.objects,
            stevedore_objectstore::Config::Memory(_)
        ));
        assert_eq!(config.upload.max_retries, 3);
    }

    #[test]
    fn reads_s3_backend() {
        let config: Config = serde_yaml::from_str(
            r#"
objects:
  type: S3
  bucket_name: uploads
  region: us-east-1
  hostname: localhost:9000
upload:
  chunk_size: 8388608
  max_in_flight: 4
"#,
        )
        .unwrap();
        assert!(matches!(config.objects, stevedore_objectstore::Config::S3(_)));
        assert_eq!(config.upload.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.upload.max_in_flight, 4);
    }
}
