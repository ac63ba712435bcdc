use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::SURVEY_STATE_TTL_SEC;
use crate::catalog::CatalogProduct;
use crate::config::digits_only;
use crate::error::GatewayError;
use crate::processor::{MessageProcessor, OutgoingMessage};
use crate::whatsapp::{ListRow, ListSection, ReplyButton};

const SURVEY_DONE_TTL_SEC: u64 = 7 * 24 * 60 * 60;

pub fn is_workflow_reply(reply_id: &str) -> bool {
    reply_id.starts_with("survey_")
        || reply_id == "order_status"
        || reply_id == "buy_item"
        || reply_id.starts_with("gender_")
}

pub async fn handle_workflow_reply(
    processor: &MessageProcessor,
    user_id: &str,
    reply_id: &str,
    title: &str,
) -> Result<(), GatewayError> {
    if reply_id.starts_with("survey_") {
        handle_survey_interaction(processor, user_id, reply_id, title).await
    } else if reply_id == "order_status" {
        handle_order_status_request(processor, user_id).await
    } else if reply_id == "buy_item" {
        send_buy_gender_list(processor, user_id).await
    } else if reply_id.starts_with("gender_") {
        send_gender_prompt(processor, user_id, reply_id).await
    } else {
        Ok(())
    }
}

// ---------------- catalog auto-reply ----------------

fn id_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bID\s*[:：]\s*(\d{6,})\b").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").unwrap())
}

fn digits_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{6,}").unwrap())
}

fn variants_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/variants/(\d{6,})").unwrap())
}

fn is_long_digit_run(value: &str) -> bool {
    value.len() >= 6 && value.chars().all(|c| c.is_ascii_digit())
}

/// Extract an explicit product id from a customer's text. Priority: an
/// `ID: <digits>` label, then `variant`/`id` URL query params or a
/// `/variants/<digits>` path segment, then the last long digit run.
pub fn extract_product_retailer_id(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    if let Some(captures) = id_label_re().captures(text) {
        return Some(captures[1].to_string());
    }
    for url_match in url_re().find_iter(text) {
        let Ok(url) = reqwest::Url::parse(url_match.as_str()) else {
            continue;
        };
        let mut variant_value = None;
        let mut id_value = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "variant" => variant_value = Some(value.to_string()),
                "id" => id_value = Some(value.to_string()),
                _ => {}
            }
        }
        if let Some(v) = variant_value.filter(|v| is_long_digit_run(v)) {
            return Some(v);
        }
        if let Some(v) = id_value.filter(|v| is_long_digit_run(v)) {
            return Some(v);
        }
        if let Some(captures) = variants_path_re().captures(url.path()) {
            return Some(captures[1].to_string());
        }
    }
    digits_run_re()
        .find_iter(text)
        .last()
        .map(|m| m.as_str().to_string())
}

/// Lowercased alphanumeric tokens of length ≥ 2.
pub fn normalize_for_match(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect()
}

/// Overlap ratio relative to the product name's tokens, with a 0.2 bonus when
/// the normalized name appears verbatim in the text. Clamped to 1.0.
pub fn score_product_name_match(text_tokens: &[String], product_name: Option<&str>) -> f64 {
    let Some(name) = product_name else { return 0.0 };
    let name_tokens = normalize_for_match(name);
    if name_tokens.is_empty() {
        return 0.0;
    }
    let name_set: std::collections::HashSet<&String> = name_tokens.iter().collect();
    let text_set: std::collections::HashSet<&String> = text_tokens.iter().collect();
    let common = name_set.intersection(&text_set).count();
    let mut score = common as f64 / name_set.len() as f64;
    let text_joined = text_tokens.join(" ");
    let name_joined = name_tokens.join(" ");
    if !name_joined.is_empty() && text_joined.contains(&name_joined) {
        score += 0.2;
    }
    score.min(1.0)
}

/// Best fuzzy name match among products that have at least one image.
pub fn best_catalog_match<'a>(
    products: &'a [CatalogProduct],
    text: &str,
    min_score: f64,
) -> Option<&'a CatalogProduct> {
    let text_tokens = normalize_for_match(text);
    if text_tokens.is_empty() {
        return None;
    }
    let mut best: Option<(f64, &CatalogProduct)> = None;
    for product in products {
        if product.images.is_empty() {
            continue;
        }
        let score = score_product_name_match(&text_tokens, product.name.as_deref());
        if score <= 0.0 {
            continue;
        }
        if best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, product));
        }
    }
    best.filter(|(score, _)| *score >= min_score).map(|(_, p)| p)
}

/// Gates, in order: feature flag, whitelist, 24h cooldown, quick-reply branch
/// for texts with no URL and no digits, explicit id extraction, fuzzy name
/// match.
pub async fn maybe_auto_reply_with_catalog(
    processor: &MessageProcessor,
    user_id: &str,
    text: &str,
) -> Result<(), GatewayError> {
    if !processor.auto_reply_enabled {
        return Ok(());
    }
    if !processor.auto_reply_test_numbers.is_empty()
        && !processor
            .auto_reply_test_numbers
            .contains(&digits_only(user_id))
    {
        return Ok(());
    }
    if processor.cache.was_auto_reply_recent(user_id).await {
        return Ok(());
    }

    let has_url = url_re().is_match(text);
    let has_digit = text.chars().any(|c| c.is_ascii_digit());
    if !has_url && !has_digit {
        processor
            .process_outgoing_message(OutgoingMessage {
                user_id: user_id.to_string(),
                kind: Some("buttons".into()),
                message: Some(
                    "Veuillez choisir une option :\nJe veux acheter un article\n\
                     Je veux vérifier le statut de ma commande\n\n\
                     اختر خيارًا:\nأريد شراء منتج\nأريد التحقق من حالة طلبي"
                        .into(),
                ),
                buttons: Some(vec![
                    ReplyButton {
                        id: "buy_item".into(),
                        title: "Acheter | شراء".into(),
                    },
                    ReplyButton {
                        id: "order_status".into(),
                        title: "Statut | حالة".into(),
                    },
                ]),
                ..Default::default()
            })
            .await?;
        processor.cache.mark_auto_reply_sent(user_id).await;
        return Ok(());
    }

    if let Some(raw_id) = extract_product_retailer_id(text) {
        let resolved = processor.shop.resolve_variant(&raw_id).await;
        let (resolved_id, resolved_variant) = match resolved {
            Some((id, variant)) => (Some(id), Some(variant)),
            None => (None, None),
        };
        let products = processor.catalog.get_cached_products();
        let matched = products
            .iter()
            .find(|p| p.retailer_id.as_deref() == Some(raw_id.as_str()));

        if let Some(product) = matched {
            processor
                .process_outgoing_message(OutgoingMessage {
                    user_id: user_id.to_string(),
                    kind: Some("catalog_item".into()),
                    // The UI carries the resolved variant id for add-to-order;
                    // the upstream interactive send uses the catalog id.
                    product_retailer_id: Some(resolved_id.clone().unwrap_or_else(|| raw_id.clone())),
                    retailer_id: product.retailer_id.clone(),
                    caption: resolved_variant
                        .as_ref()
                        .and_then(|v| v.title.clone())
                        .or_else(|| product.name.clone()),
                    ..Default::default()
                })
                .await?;
        } else {
            let caption = resolved_variant.as_ref().map(|variant| {
                let title = variant.title.clone().unwrap_or_default();
                let price = variant.price.clone().unwrap_or_default();
                format!("{title} - {price} MAD")
                    .trim_matches(|c: char| c == ' ' || c == '-')
                    .to_string()
            });
            processor
                .process_outgoing_message(OutgoingMessage {
                    user_id: user_id.to_string(),
                    kind: Some("catalog_item".into()),
                    product_retailer_id: Some(resolved_id.unwrap_or_else(|| raw_id.clone())),
                    caption,
                    ..Default::default()
                })
                .await?;
        }
        processor
            .process_outgoing_message(OutgoingMessage {
                user_id: user_id.to_string(),
                kind: Some("text".into()),
                message: Some(
                    "Bienvenue ! Veuillez confirmer la taille et la couleur souhaitées.\n\
                     أهلًا بك! يرجى تأكيد المقاس واللون المطلوبين لهذا المنتج."
                        .into(),
                ),
                ..Default::default()
            })
            .await?;
        processor.cache.mark_auto_reply_sent(user_id).await;
        return Ok(());
    }

    let products = processor.catalog.get_cached_products();
    let Some(product) = best_catalog_match(&products, text, processor.auto_reply_min_score) else {
        return Ok(());
    };
    let Some(image_url) = product.images.first().map(|img| img.url.clone()) else {
        return Ok(());
    };
    let caption = [product.name.clone(), product.price.clone()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" - ");
    processor
        .process_outgoing_message(OutgoingMessage {
            user_id: user_id.to_string(),
            kind: Some("image".into()),
            message: Some(image_url.clone()),
            url: Some(image_url),
            caption: Some(caption),
            price: product.price.clone(),
            ..Default::default()
        })
        .await?;
    processor.cache.mark_auto_reply_sent(user_id).await;
    Ok(())
}

// ---------------- survey flow ----------------

pub async fn send_survey_invite(
    processor: &MessageProcessor,
    user_id: &str,
) -> Result<(), GatewayError> {
    processor
        .process_outgoing_message(OutgoingMessage {
            user_id: user_id.to_string(),
            kind: Some("buttons".into()),
            message: Some(
                "Aidez-nous à nous améliorer et obtenez 15% de réduction sur votre commande.\n\
                 ساعدنا على التحسن واحصل على خصم 15% على طلبك."
                    .into(),
            ),
            buttons: Some(vec![
                ReplyButton {
                    id: "survey_start_ok".into(),
                    title: "موافق | OK".into(),
                },
                ReplyButton {
                    id: "survey_decline".into(),
                    title: "غير مهتم | Pas int.".into(),
                },
            ]),
            ..Default::default()
        })
        .await?;
    Ok(())
}

pub fn parse_rating(reply_id: &str) -> Option<u8> {
    let raw: u8 = reply_id.rsplit('_').next()?.parse().ok()?;
    Some(raw.clamp(1, 5))
}

/// Arabic and French labels for an improvement choice, falling back to the
/// visible row title.
pub fn improvement_labels(reply_id: &str, title: &str) -> (String, String) {
    match reply_id {
        "survey_improve_products" => ("المزيد من المنتجات".into(), "Plus de produits".into()),
        "survey_improve_service" => ("تحسينات الخدمة".into(), "Améliorations du service".into()),
        "survey_improve_prices" => (
            "أسعار أكثر ملاءمة".into(),
            "Des prix plus abordables".into(),
        ),
        "survey_improve_quality" => (
            "منتجات ذات جودة أعلى".into(),
            "Produits de meilleure qualité".into(),
        ),
        _ => (title.to_string(), title.to_string()),
    }
}

pub fn survey_summary(rating: u8, improvement_fr: &str, improvement_ar: &str) -> String {
    let stars = if rating > 0 {
        "⭐".repeat(rating.clamp(1, 5) as usize)
    } else {
        "—".into()
    };
    format!(
        "Merci pour votre aide ! Cela nous aidera à nous améliorer.\n\
         Évaluation: {stars} ({rating}/5)\n\
         Amélioration prioritaire: {improvement_fr}\n\n\
         شكرًا لمساعدتك! هذا سيساعدنا على التحسن.\n\
         التقييم: {stars} ({rating}/5)\n\
         الأولوية في التحسين: {improvement_ar}\n\n\
         لقد حصلت على خصم 15% — يرجى إرسال صور المنتجات التي تريدها في طلبك.\n\
         Vous bénéficiez de 15% de réduction — envoyez-nous les images des articles souhaités."
    )
}

async fn handle_survey_interaction(
    processor: &MessageProcessor,
    user_id: &str,
    reply_id: &str,
    title: &str,
) -> Result<(), GatewayError> {
    let mut state = processor
        .cache
        .get_survey_state(user_id)
        .await
        .unwrap_or_else(|| json!({}));

    if reply_id == "survey_start_ok" {
        let state = json!({
            "stage": "rating",
            "started_at": chrono::Utc::now().to_rfc3339(),
        });
        processor
            .cache
            .set_survey_state(user_id, &state, SURVEY_STATE_TTL_SEC)
            .await;
        let sections = vec![ListSection {
            title: Some("Rating | التقييم".into()),
            rows: (1..=5usize)
                .map(|n| ListRow {
                    id: format!("survey_rate_{n}"),
                    title: format!("{} {n}", "⭐".repeat(n)),
                    description: None,
                })
                .collect(),
        }];
        processor
            .process_outgoing_message(OutgoingMessage {
                user_id: user_id.to_string(),
                kind: Some("list".into()),
                message: Some(
                    "Comment évaluez-vous la performance de notre agent ?\n\
                     كيف تقيم أداء وكيل المحادثة؟"
                        .into(),
                ),
                button_text: Some("Choisir | اختر".into()),
                sections: Some(sections),
                ..Default::default()
            })
            .await?;
        return Ok(());
    }

    if reply_id == "survey_decline" {
        processor.cache.clear_survey_state(user_id).await;
        processor.cache.mark_survey_invited(user_id).await;
        processor
            .process_outgoing_message(OutgoingMessage {
                user_id: user_id.to_string(),
                kind: Some("text".into()),
                message: Some(
                    "Merci pour votre temps. Si vous changez d'avis, écrivez-nous.\n\
                     شكرًا لوقتك. إذا غيرت رأيك، راسلنا في أي وقت."
                        .into(),
                ),
                ..Default::default()
            })
            .await?;
        return Ok(());
    }

    if reply_id.starts_with("survey_rate_") {
        let Some(rating) = parse_rating(reply_id) else {
            return Ok(());
        };
        state["rating"] = json!(rating);
        state["stage"] = json!("improvement");
        processor
            .cache
            .set_survey_state(user_id, &state, SURVEY_STATE_TTL_SEC)
            .await;

        let sections = vec![ListSection {
            title: Some("Improve | تحسين".into()),
            rows: vec![
                ListRow {
                    id: "survey_improve_products".into(),
                    title: "المزيد من المنتجات".into(),
                    description: Some("Plus de produits".into()),
                },
                ListRow {
                    id: "survey_improve_service".into(),
                    title: "تحسينات الخدمة".into(),
                    description: Some("Améliorations du service".into()),
                },
                ListRow {
                    id: "survey_improve_prices".into(),
                    title: "أسعار ملائمة".into(),
                    description: Some("Des prix plus abordables".into()),
                },
                ListRow {
                    id: "survey_improve_quality".into(),
                    title: "جودة أعلى".into(),
                    description: Some("Produits de meilleure qualité".into()),
                },
            ],
        }];
        processor
            .process_outgoing_message(OutgoingMessage {
                user_id: user_id.to_string(),
                kind: Some("list".into()),
                message: Some(
                    "Quel aspect souhaitez-vous que nous améliorions le plus ?\n\
                     ما هو أكثر شيء تريد منا تحسينه؟"
                        .into(),
                ),
                button_text: Some("Choisir | اختر".into()),
                sections: Some(sections),
                ..Default::default()
            })
            .await?;
        return Ok(());
    }

    if reply_id.starts_with("survey_improve_") {
        let (improvement_ar, improvement_fr) = improvement_labels(reply_id, title);
        let rating = state
            .get("rating")
            .and_then(|r| r.as_u64())
            .unwrap_or(0)
            .clamp(0, 5) as u8;
        state["improvement"] = json!(reply_id);
        state["stage"] = json!("done");
        processor
            .cache
            .set_survey_state(user_id, &state, SURVEY_DONE_TTL_SEC)
            .await;
        processor.cache.mark_survey_invited(user_id).await;
        processor
            .process_outgoing_message(OutgoingMessage {
                user_id: user_id.to_string(),
                kind: Some("text".into()),
                message: Some(survey_summary(rating, &improvement_fr, &improvement_ar)),
                ..Default::default()
            })
            .await?;
        return Ok(());
    }

    debug!("Unhandled survey reply {reply_id} for {user_id}");
    Ok(())
}

// ---------------- order-status and buy flows ----------------

async fn send_bilingual_text(
    processor: &MessageProcessor,
    user_id: &str,
    message: &str,
) -> Result<(), GatewayError> {
    processor
        .process_outgoing_message(OutgoingMessage {
            user_id: user_id.to_string(),
            kind: Some("text".into()),
            message: Some(message.to_string()),
            ..Default::default()
        })
        .await?;
    Ok(())
}

async fn handle_order_status_request(
    processor: &MessageProcessor,
    user_id: &str,
) -> Result<(), GatewayError> {
    let Some(customer_id) = processor.shop.fetch_customer_id_by_phone(user_id).await else {
        return send_bilingual_text(
            processor,
            user_id,
            "Aucune commande trouvée pour votre numéro.\n\
             لم يتم العثور على أي طلب مرتبط برقم هاتفك.",
        )
        .await;
    };
    let orders = processor.shop.fetch_recent_orders(&customer_id, 4, 10).await;
    if orders.is_empty() {
        return send_bilingual_text(
            processor,
            user_id,
            "Aucune commande des 4 derniers jours.\n\
             لا توجد طلبات خلال آخر 4 أيام.",
        )
        .await;
    }

    let mut lines_fr = vec!["Voici vos commandes (4 derniers jours):".to_string()];
    let mut lines_ar = vec!["هذه طلباتك خلال آخر 4 أيام:".to_string()];
    let mut images: Vec<(String, String)> = Vec::new();
    for order in orders.iter().take(3) {
        let fulfilled = order.fulfillment_status.as_deref() == Some("fulfilled");
        let status_fr = if fulfilled { "expédiée" } else { "non expédiée" };
        let status_ar = if fulfilled { "مكتملة" } else { "غير مكتملة" };
        let date = order.created_at.chars().take(10).collect::<String>();
        lines_fr.push(format!("- {} — {date} — Statut: {status_fr}", order.name));
        lines_ar.push(format!("- {} — {date} — الحالة: {status_ar}", order.name));
        for item in order.line_items.iter().take(2) {
            lines_fr.push(format!(
                "  • {} — {} ×{}",
                item.title, item.variant_title, item.quantity
            ));
            lines_ar.push(format!(
                "  • {} — {} ×{}",
                item.title, item.variant_title, item.quantity
            ));
            if images.len() < 2 {
                if let Some(variant_id) = &item.variant_id {
                    if let Some((_, variant)) = processor.shop.resolve_variant(variant_id).await {
                        if let Some(src) = variant.image_src {
                            images.push((src, format!("{} — {}", item.title, item.variant_title)));
                        }
                    }
                }
            }
        }
    }
    let summary = format!("{}\n\n{}", lines_fr.join("\n"), lines_ar.join("\n"));
    send_bilingual_text(processor, user_id, &summary).await?;

    for (url, caption) in images {
        if let Err(e) = processor
            .process_outgoing_message(OutgoingMessage {
                user_id: user_id.to_string(),
                kind: Some("image".into()),
                message: Some(url.clone()),
                url: Some(url),
                caption: Some(caption),
                ..Default::default()
            })
            .await
        {
            warn!("Order image send failed: {e}");
        }
    }
    Ok(())
}

async fn send_buy_gender_list(
    processor: &MessageProcessor,
    user_id: &str,
) -> Result<(), GatewayError> {
    let sections = vec![ListSection {
        title: Some("Genre | النوع".into()),
        rows: vec![
            ListRow {
                id: "gender_girls".into(),
                title: "Fille | بنت".into(),
                description: None,
            },
            ListRow {
                id: "gender_boys".into(),
                title: "Garçon | ولد".into(),
                description: None,
            },
        ],
    }];
    processor
        .process_outgoing_message(OutgoingMessage {
            user_id: user_id.to_string(),
            kind: Some("list".into()),
            message: Some("Veuillez choisir: Fille ou Garçon\nيرجى الاختيار: بنت أم ولد".into()),
            button_text: Some("Choisir | اختر".into()),
            sections: Some(sections),
            ..Default::default()
        })
        .await?;
    Ok(())
}

async fn send_gender_prompt(
    processor: &MessageProcessor,
    user_id: &str,
    reply_id: &str,
) -> Result<(), GatewayError> {
    let message = if reply_id == "gender_girls" {
        "Filles: indiquez l'âge (0 mois à 7 ans) et la pointure (16 à 38).\n\
         البنات: يرجى تزويدنا بالعمر (من 0 شهر إلى 7 سنوات) ومقاس الحذاء (من 16 إلى 38)."
    } else {
        "Garçons: indiquez l'âge (0 mois à 10 ans) et la pointure (16 à 38).\n\
         الأولاد: يرجى تزويدنا بالعمر (من 0 شهر إلى 10 سنوات) ومقاس الحذاء (من 16 إلى 38)."
    };
    send_bilingual_text(processor, user_id, message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProductImage;

    fn product(retailer_id: &str, name: &str, price: &str, with_image: bool) -> CatalogProduct {
        CatalogProduct {
            retailer_id: Some(retailer_id.into()),
            name: Some(name.into()),
            price: Some(price.into()),
            availability: None,
            quantity: None,
            images: if with_image {
                vec![ProductImage {
                    url: format!("http://img/{retailer_id}.jpg"),
                }]
            } else {
                Vec::new()
            },
        }
    }

    #[test]
    fn test_is_workflow_reply() {
        assert!(is_workflow_reply("survey_start_ok"));
        assert!(is_workflow_reply("survey_rate_4"));
        assert!(is_workflow_reply("order_status"));
        assert!(is_workflow_reply("buy_item"));
        assert!(is_workflow_reply("gender_girls"));
        assert!(!is_workflow_reply("something_else"));
    }

    #[test]
    fn test_extract_id_from_label() {
        assert_eq!(
            extract_product_retailer_id("Je veux ce modèle ID: 123456789").as_deref(),
            Some("123456789")
        );
        assert_eq!(
            extract_product_retailer_id("id : 987654321 svp").as_deref(),
            Some("987654321")
        );
        // Five digits satisfy neither the label pattern nor the run fallback.
        assert!(extract_product_retailer_id("ID: 12345").is_none());
    }

    #[test]
    fn test_extract_id_from_urls() {
        assert_eq!(
            extract_product_retailer_id("https://shop.example/products/x?variant=445566778899")
                .as_deref(),
            Some("445566778899")
        );
        assert_eq!(
            extract_product_retailer_id("look https://shop.example/page?id=112233445566")
                .as_deref(),
            Some("112233445566")
        );
        assert_eq!(
            extract_product_retailer_id("https://shop.example/admin/variants/665544332211/edit")
                .as_deref(),
            Some("665544332211")
        );
    }

    #[test]
    fn test_extract_id_last_digit_run_wins() {
        assert_eq!(
            extract_product_retailer_id("maybe 111111 or rather 222222").as_deref(),
            Some("222222")
        );
        assert!(extract_product_retailer_id("no ids here").is_none());
        assert!(extract_product_retailer_id("").is_none());
    }

    #[test]
    fn test_normalize_for_match() {
        assert_eq!(
            normalize_for_match("Slippers-Batman, taille 32!"),
            vec!["slippers", "batman", "taille", "32"]
        );
        // Single characters are dropped.
        assert_eq!(normalize_for_match("a b cd"), vec!["cd"]);
    }

    #[test]
    fn test_score_overlap_and_bonus() {
        let text_tokens = normalize_for_match("je veux les slippers batman");
        // Full overlap plus substring bonus clamps at 1.0.
        let score = score_product_name_match(&text_tokens, Some("Slippers Batman"));
        assert!((score - 1.0).abs() < f64::EPSILON);

        // Half of the name tokens present, no substring bonus.
        let score = score_product_name_match(&text_tokens, Some("Batman Socks"));
        assert!((score - 0.5).abs() < f64::EPSILON);

        assert_eq!(score_product_name_match(&text_tokens, None), 0.0);
        assert_eq!(score_product_name_match(&text_tokens, Some("---")), 0.0);
    }

    #[test]
    fn test_best_catalog_match_threshold_and_images() {
        let products = vec![
            product("1", "Slippers Batman", "115 MAD", true),
            product("2", "Slippers Spiderman", "120 MAD", true),
            product("3", "Slippers Batman Deluxe", "150 MAD", false),
        ];
        let matched = best_catalog_match(&products, "je veux les slippers batman", 0.6).unwrap();
        assert_eq!(matched.retailer_id.as_deref(), Some("1"));

        // Below threshold yields nothing.
        assert!(best_catalog_match(&products, "bonjour", 0.6).is_none());
        // Products without images are never offered.
        let imageless = vec![product("3", "Slippers Batman", "115", false)];
        assert!(best_catalog_match(&imageless, "slippers batman", 0.6).is_none());
    }

    #[test]
    fn test_parse_rating_clamps() {
        assert_eq!(parse_rating("survey_rate_4"), Some(4));
        assert_eq!(parse_rating("survey_rate_9"), Some(5));
        assert_eq!(parse_rating("survey_rate_x"), None);
    }

    #[test]
    fn test_improvement_labels() {
        let (ar, fr) = improvement_labels("survey_improve_quality", "");
        assert_eq!(ar, "منتجات ذات جودة أعلى");
        assert_eq!(fr, "Produits de meilleure qualité");
        let (ar, fr) = improvement_labels("survey_improve_other", "Autre");
        assert_eq!(ar, "Autre");
        assert_eq!(fr, "Autre");
    }

    #[test]
    fn test_survey_summary_contains_stars_and_labels() {
        let summary = survey_summary(
            4,
            "Produits de meilleure qualité",
            "منتجات ذات جودة أعلى",
        );
        assert!(summary.contains("⭐⭐⭐⭐ (4/5)"));
        assert!(!summary.contains("⭐⭐⭐⭐⭐"));
        assert!(summary.contains("منتجات ذات جودة أعلى"));
        assert!(summary.contains("Produits de meilleure qualité"));
        assert!(summary.contains("15%"));
    }
}
