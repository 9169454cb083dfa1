use cv_videoio::{FrameWriter, ImageSequence, ImageSource, MemorySource, PngSequenceWriter, VideoError};
use image::{GrayImage, Luma};
use tempfile::tempdir;

fn flat(value: u8) -> GrayImage {
    GrayImage::from_pixel(64, 48, Luma([value]))
}

#[test]
fn test_png_sequence_roundtrip() {
    let dir = tempdir().unwrap();
    let mut writer = PngSequenceWriter::new(dir.path(), "frame").unwrap();
    for i in 0..5u8 {
        writer.write(&flat(i * 10)).unwrap();
    }
    assert_eq!(writer.frame_count(), 5);

    let mut source = ImageSequence::open(dir.path()).unwrap();
    assert_eq!(source.len(), 5);
    for i in 0..5u8 {
        assert_eq!(source.remaining_hint(), Some(5 - i as usize));
        let img = source.next_frame().unwrap().unwrap();
        assert_eq!(img.dimensions(), (64, 48));
        assert_eq!(img.get_pixel(0, 0)[0], i * 10);
    }
    assert!(source.next_frame().unwrap().is_none());
    assert!(source.next_frame().unwrap().is_none());
}

#[test]
fn test_sequence_is_sorted_and_filtered() {
    let dir = tempdir().unwrap();
    flat(30).save(dir.path().join("b.png")).unwrap();
    flat(10).save(dir.path().join("a.png")).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

    let source = ImageSequence::open(dir.path()).unwrap();
    let names: Vec<_> = source
        .paths()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["a.png", "b.png"]);
}

#[test]
fn test_corrupt_frame_is_skipped_not_fatal() {
    let dir = tempdir().unwrap();
    flat(10).save(dir.path().join("0.png")).unwrap();
    std::fs::write(dir.path().join("1.png"), b"garbage").unwrap();
    flat(20).save(dir.path().join("2.png")).unwrap();

    let mut source = ImageSequence::open(dir.path()).unwrap();
    assert_eq!(source.next_frame().unwrap().unwrap().get_pixel(0, 0)[0], 10);
    match source.next_frame() {
        Err(VideoError::Unreadable { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected unreadable frame, got {other:?}"),
    }
    assert_eq!(source.next_frame().unwrap().unwrap().get_pixel(0, 0)[0], 20);
    assert!(source.next_frame().unwrap().is_none());
}

#[test]
fn test_missing_directory_is_rejected() {
    assert!(matches!(
        ImageSequence::open("/non/existent/path"),
        Err(VideoError::InvalidParameters(_))
    ));
    let dir = tempdir().unwrap();
    assert!(PngSequenceWriter::new(dir.path(), "").is_err());
}

#[test]
fn test_memory_source_preserves_order() {
    let mut source: MemorySource = [flat(1), flat(2)].into_iter().collect();
    source.push(flat(3));
    let mut boxed: Box<dyn ImageSource> = Box::new(source);
    let mut seen = Vec::new();
    while let Some(frame) = boxed.next_frame().unwrap() {
        seen.push(frame.get_pixel(0, 0)[0]);
    }
    assert_eq!(seen, [1, 2, 3]);
}
