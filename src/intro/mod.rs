//! The logo entrance animation.
//!
//! [`render_intro`] colours every shape of the logomark and returns the plan
//! of tweens a browser runtime plays once per page load. Shapes drop in one
//! after another with an elastic ease, the logotype fades in on its own.

pub mod dom;
mod color;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use self::dom::Document;
pub use color::random_light_colors;

pub const LOGOTYPE: &str = ".js-logotype";
pub const LOGOMARK: &str = ".js-logomark";

/// Seconds.
const DURATION: f32 = 1.0;
const SHAPE_DELAY: f32 = 0.24;
const STAGGER: f32 = 0.05;
const LOGOTYPE_DELAY: f32 = 0.5;
const DROP: f32 = -100.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntroError {
    #[error("No element matches '{0}'.")]
    MissingElement(&'static str),
}

/// Animated properties. `y` is a vertical offset in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f32>,
    pub opacity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "index")]
pub enum Target {
    Logotype,
    /// Index among the logomark's element children.
    Shape(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ease {
    ElasticOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tween {
    pub target: Target,
    /// Starting state; `None` tweens from whatever is current.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Frame>,
    pub to: Frame,
    pub delay: f32,
    pub duration: f32,
    pub ease: Ease,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntroPlan {
    /// One per shape, in document order.
    pub shapes: Vec<Tween>,
    /// Runs on its own timeline, independent of the shapes.
    pub logotype: Tween,
    /// The fill given to each shape.
    pub fills: Vec<String>,
}

impl IntroPlan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Colours the logomark's shapes in `document` and plans their entrance.
///
/// Both elements are looked up before anything is touched, so a missing one
/// leaves the document as it was.
pub fn render_intro(document: &mut Document, rng: &mut impl Rng) -> Result<IntroPlan, IntroError> {
    if document.query_selector(LOGOTYPE).is_none() {
        return Err(IntroError::MissingElement(LOGOTYPE));
    }

    let logomark = document
        .query_selector_mut(LOGOMARK)
        .ok_or(IntroError::MissingElement(LOGOMARK))?;

    let count = logomark.element_children().count();
    let fills = random_light_colors(count, rng);

    for (shape, fill) in logomark.element_children_mut().zip(&fills) {
        shape.set_attribute("fill", fill.as_str());
    }

    let shapes = (0..count)
        .map(|i| Tween {
            target: Target::Shape(i),
            from: Some(Frame {
                y: Some(DROP),
                opacity: 0.0,
            }),
            to: Frame {
                y: Some(0.0),
                opacity: 1.0,
            },
            delay: SHAPE_DELAY + i as f32 * STAGGER,
            duration: DURATION,
            ease: Ease::ElasticOut,
        })
        .collect();

    let logotype = Tween {
        target: Target::Logotype,
        from: None,
        to: Frame {
            y: None,
            opacity: 1.0,
        },
        delay: LOGOTYPE_DELAY,
        duration: DURATION,
        ease: Ease::ElasticOut,
    };

    tracing::debug!(shapes = count, "planned intro");

    Ok(IntroPlan {
        shapes,
        logotype,
        fills,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::dom::Element;
    use super::*;

    fn page(shapes: usize) -> Document {
        let mut mark = Element::new("svg").attr("class", "js-logomark").text("\n");
        for _ in 0..shapes {
            mark = mark.child(Element::new("path").attr("d", "M0 0")).text("\n");
        }

        Document::new(
            Element::new("body")
                .child(mark)
                .child(Element::new("span").attr("class", "js-logotype").text("Mint")),
        )
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1)
    }

    #[test]
    fn test_fills_every_shape() {
        let mut doc = page(5);
        let plan = render_intro(&mut doc, &mut rng()).unwrap();

        assert_eq!(plan.fills.len(), 5);
        assert_eq!(plan.fills.iter().collect::<HashSet<_>>().len(), 5);

        let mark = doc.query_selector(LOGOMARK).unwrap();
        let fills: Vec<_> = mark
            .element_children()
            .map(|shape| shape.get_attribute("fill").unwrap())
            .collect();
        assert_eq!(fills, plan.fills);
    }

    #[test]
    fn test_shapes_are_staggered() {
        let plan = render_intro(&mut page(3), &mut rng()).unwrap();

        assert_eq!(plan.shapes.len(), 3);
        for (i, tween) in plan.shapes.iter().enumerate() {
            assert_eq!(tween.target, Target::Shape(i));
            assert_eq!(tween.from, Some(Frame { y: Some(-100.0), opacity: 0.0 }));
            assert_eq!(tween.to, Frame { y: Some(0.0), opacity: 1.0 });
            assert_eq!(tween.duration, 1.0);
            assert_eq!(tween.ease, Ease::ElasticOut);
            assert!((tween.delay - (0.24 + 0.05 * i as f32)).abs() < 1e-6);
        }

        assert_eq!(plan.logotype.target, Target::Logotype);
        assert_eq!(plan.logotype.from, None);
        assert_eq!(plan.logotype.to, Frame { y: None, opacity: 1.0 });
        assert_eq!(plan.logotype.delay, 0.5);
    }

    #[test]
    fn test_empty_logomark() {
        let plan = render_intro(&mut page(0), &mut rng()).unwrap();
        assert!(plan.shapes.is_empty());
        assert!(plan.fills.is_empty());
    }

    #[test]
    fn test_missing_elements() {
        let mut doc = Document::new(
            Element::new("body").child(Element::new("svg").attr("class", "js-logomark")),
        );
        let before = doc.clone();
        assert_eq!(
            render_intro(&mut doc, &mut rng()),
            Err(IntroError::MissingElement(LOGOTYPE))
        );
        assert_eq!(doc, before);

        let mut doc = Document::new(
            Element::new("body").child(Element::new("span").attr("class", "js-logotype")),
        );
        assert_eq!(
            render_intro(&mut doc, &mut rng()),
            Err(IntroError::MissingElement(LOGOMARK))
        );
    }

    #[test]
    fn test_plan_json() {
        let plan = render_intro(&mut page(1), &mut rng()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();

        assert_eq!(json["shapes"][0]["target"]["kind"], "shape");
        assert_eq!(json["shapes"][0]["target"]["index"], 0);
        assert_eq!(json["shapes"][0]["from"]["y"], -100.0);
        assert_eq!(json["shapes"][0]["ease"], "elastic-out");
        assert_eq!(json["logotype"]["target"]["kind"], "logotype");
        assert!(json["logotype"].get("from").is_none());
        assert!(json["logotype"]["to"].get("y").is_none());
    }
}
