use image::RgbImage;

/// A model owned by the [`crate::InferenceEngine`] worker thread.
///
/// `run` takes `&mut self` since decoders keep a cache between steps; the
/// engine guarantees a single caller at a time.
pub trait InferenceModel {
    type Request: RequestMetadata;
    type Response;
    /// Reported to the caller of that request only.
    type Error: std::error::Error + Send + Sync + 'static;

    fn run(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

/// Summary of a request kept around after the request itself is consumed.
///
/// Used for the log line of a finished caption, so it should describe the
/// image without copying its pixels.
pub trait RequestMetadata {
    type Metadata: Send + 'static;

    fn metadata(&self) -> Self::Metadata;
}

/// A decoded image to caption.
pub struct CaptionRequest {
    /// The rgb8 image, any size.
    pub image: RgbImage,
    /// Upper bound on the generated sequence, start token included.
    pub max_length: usize,
}

/// Size of the uploaded image and the caption budget.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptionMetadata {
    /// Width of the decoded image, before resizing.
    pub width: u32,
    /// Height of the decoded image, before resizing.
    pub height: u32,
    /// Caption budget of the request, start token included.
    pub max_length: usize,
}

impl RequestMetadata for CaptionRequest {
    type Metadata = CaptionMetadata;

    fn metadata(&self) -> Self::Metadata {
        CaptionMetadata {
            width: self.image.width(),
            height: self.image.height(),
            max_length: self.max_length,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptionResponse {
    /// The caption with special tokens removed.
    pub caption: String,
    /// Number of tokens sampled from the decoder.
    pub generated_tokens: usize,
}

/// Any model that turns a [`CaptionRequest`] into a [`CaptionResponse`].
pub trait CaptionModel:
    InferenceModel<Request = CaptionRequest, Response = CaptionResponse> + Send + 'static
{
}

impl<T> CaptionModel for T where
    T: InferenceModel<Request = CaptionRequest, Response = CaptionResponse> + Send + 'static
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn caption_metadata_reports_image_size() {
        let request = CaptionRequest {
            image: RgbImage::from_pixel(12, 7, Rgb([1, 2, 3])),
            max_length: 100,
        };
        assert_eq!(
            request.metadata(),
            CaptionMetadata {
                width: 12,
                height: 7,
                max_length: 100,
            }
        );
    }
}
