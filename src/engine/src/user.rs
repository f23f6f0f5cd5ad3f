/// Descriptor of the end user behind a topic connection.
///
/// Only the id is required; the remaining fields exist for presentation
/// layers built on top of the fabric. A `color_index` of `-1` means "let
/// the engine assign one".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub name: Option<String>,
    pub abbreviation: Option<String>,
    pub image: Option<String>,
    pub color_index: i32,
}

impl UserInfo {
    pub fn new(id: impl Into<String>) -> Self {
        UserInfo {
            id: id.into(),
            name: None,
            abbreviation: None,
            image: None,
            color_index: -1,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_abbreviation(mut self, abbreviation: impl Into<String>) -> Self {
        self.abbreviation = Some(abbreviation.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_color_index(mut self, color_index: i32) -> Self {
        self.color_index = color_index;
        self
    }
}
