#[cfg(test)]
mod tests {
    use dejaview::extractor::{fingerprint, ArtifactStore, Extractor, PE_SIGNATURE};
    use std::fs;
    use tempfile::TempDir;

    fn payload_with_pe_at(offset: usize, tail: usize) -> Vec<u8> {
        let mut blob: Vec<u8> = (0..offset).map(|i| b'a' + (i % 26) as u8).collect();
        blob.extend_from_slice(&PE_SIGNATURE);
        blob.extend((0..tail).map(|i| (i * 7) as u8));
        blob
    }

    #[test]
    fn test_pe_at_offset_ten_is_carved_to_disk() {
        let dir = TempDir::new().unwrap();
        let extractor = Extractor::new(Some(ArtifactStore::new(dir.path())));
        let blob = payload_with_pe_at(10, 48);

        let result = extractor.extract(&blob);
        let expected = fingerprint(&blob[10..]);
        assert!(result.found);
        assert_eq!(result.offset, Some(10));
        assert_eq!(result.size, Some(51));
        assert_eq!(result.fingerprint.as_deref(), Some(expected.as_str()));

        let written = fs::read(dir.path().join(&expected)).unwrap();
        assert_eq!(written, &blob[10..]);
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let extractor = Extractor::new(Some(ArtifactStore::new(dir.path())));
        let blob = payload_with_pe_at(3, 100);

        let first = extractor.extract(&blob);
        let second = extractor.extract(&blob);
        assert_eq!(first, second);

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = dir.path().join(first.fingerprint.unwrap());
        assert_eq!(fs::read(path).unwrap(), &blob[3..]);
    }

    #[test]
    fn test_no_signature_is_a_normal_result() {
        let dir = TempDir::new().unwrap();
        let extractor = Extractor::new(Some(ArtifactStore::new(dir.path())));

        let result = extractor.extract(b"/wEPDwUKLTEyMzQ1Njc4OWRk MZ without the stub byte");
        assert!(!result.found);
        assert_eq!(result.fingerprint, None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_artifact_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("evidence").join("carved");
        let extractor = Extractor::new(Some(ArtifactStore::new(&nested)));

        let result = extractor.extract(&payload_with_pe_at(0, 4));
        assert!(nested.join(result.fingerprint.unwrap()).is_file());
    }

    #[test]
    fn test_detached_extractor_still_fingerprints() {
        let blob = payload_with_pe_at(5, 5);
        let result = Extractor::detached().extract(&blob);
        assert_eq!(result.fingerprint, Some(fingerprint(&blob[5..])));
    }

    #[test]
    fn test_corrupt_existing_artifact_is_replaced() {
        let dir = TempDir::new().unwrap();
        let extractor = Extractor::new(Some(ArtifactStore::new(dir.path())));
        let blob = payload_with_pe_at(7, 16);
        let expected = fingerprint(&blob[7..]);
        let path = dir.path().join(&expected);
        fs::write(&path, &blob[7..12]).unwrap();

        let result = extractor.extract(&blob);
        assert_eq!(result.fingerprint.as_deref(), Some(expected.as_str()));
        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), blob.len() - 7);
        assert_eq!(fingerprint(&on_disk), expected);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
