use std::collections::HashMap;

use stripe::{
    Client, CreateCustomer, CreatePaymentIntent, CreatePaymentIntentTransferData,
    CreateSetupIntent, Currency, Customer, CustomerId, ListPaymentMethods, PaymentIntent,
    PaymentIntentOffSession, PaymentIntentSetupFutureUsage, PaymentMethod, PaymentMethodId,
    PaymentMethodTypeFilter, SetupIntent,
};

use crate::config::Config;
use crate::error::ApiError;
use crate::models::billing::CardSummary;

/// Connect destination-charge parameters for school-collected fees.
#[derive(Debug, Clone)]
pub struct ConnectSplit {
    pub destination_account: String,
    pub platform_fee_cents: i64,
}

/// Thin wrapper around the Stripe client. All provider traffic goes through
/// here; callers never touch `stripe::Client` directly.
pub struct StripeGateway {
    client: Client,
    publishable_key: String,
    webhook_secret: String,
}

impl StripeGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(config.stripe_secret_key.clone()),
            publishable_key: config.stripe_publishable_key.clone(),
            webhook_secret: config.stripe_webhook_secret.clone(),
        }
    }

    pub fn publishable_key(&self) -> &str {
        &self.publishable_key
    }

    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    /// Create a Stripe customer and return its id.
    pub async fn create_customer(
        &self,
        email: Option<&str>,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, ApiError> {
        let mut params = CreateCustomer::new();
        params.email = email;
        params.name = Some(name);
        params.metadata = Some(metadata);

        let customer = Customer::create(&self.client, params).await?;
        Ok(customer.id.to_string())
    }

    /// Create and immediately confirm a PaymentIntent against a saved card.
    /// With `split`, the charge is routed to the school's Connect account
    /// with the platform fee retained.
    #[allow(clippy::too_many_arguments)]
    pub async fn confirm_with_saved_method(
        &self,
        amount_cents: i64,
        customer_id: &str,
        payment_method_id: &str,
        split: Option<&ConnectSplit>,
        metadata: HashMap<String, String>,
        description: &str,
        save_card: bool,
    ) -> Result<PaymentIntent, ApiError> {
        let customer = parse_customer_id(customer_id)?;
        let payment_method: PaymentMethodId = payment_method_id
            .parse()
            .map_err(|_| ApiError::bad_request("Invalid payment method id"))?;

        let mut params = CreatePaymentIntent::new(amount_cents, Currency::USD);
        params.customer = Some(customer);
        params.payment_method = Some(payment_method);
        params.payment_method_types = Some(vec!["card".to_string()]);
        params.confirm = Some(true);
        params.off_session = Some(PaymentIntentOffSession::Exists(true));
        params.metadata = Some(metadata);
        params.description = Some(description);
        if save_card {
            params.setup_future_usage = Some(PaymentIntentSetupFutureUsage::OffSession);
        }
        if let Some(split) = split {
            params.application_fee_amount = Some(split.platform_fee_cents);
            params.transfer_data = Some(CreatePaymentIntentTransferData {
                amount: None,
                destination: split.destination_account.clone(),
            });
        }

        Ok(PaymentIntent::create(&self.client, params).await?)
    }

    /// Create an unconfirmed PaymentIntent for client-side completion and
    /// return it (the caller hands the client_secret to the browser).
    pub async fn create_client_intent(
        &self,
        amount_cents: i64,
        customer_id: &str,
        split: Option<&ConnectSplit>,
        metadata: HashMap<String, String>,
        description: &str,
        save_card: bool,
    ) -> Result<PaymentIntent, ApiError> {
        let customer = parse_customer_id(customer_id)?;

        let mut params = CreatePaymentIntent::new(amount_cents, Currency::USD);
        params.customer = Some(customer);
        params.payment_method_types = Some(vec!["card".to_string()]);
        params.metadata = Some(metadata);
        params.description = Some(description);
        if save_card {
            params.setup_future_usage = Some(PaymentIntentSetupFutureUsage::OffSession);
        }
        if let Some(split) = split {
            params.application_fee_amount = Some(split.platform_fee_cents);
            params.transfer_data = Some(CreatePaymentIntentTransferData {
                amount: None,
                destination: split.destination_account.clone(),
            });
        }

        Ok(PaymentIntent::create(&self.client, params).await?)
    }

    /// SetupIntent for adding a card without charging it.
    pub async fn create_setup_intent(&self, customer_id: &str) -> Result<SetupIntent, ApiError> {
        let customer = parse_customer_id(customer_id)?;

        let mut params = CreateSetupIntent::new();
        params.customer = Some(customer);
        params.payment_method_types = Some(vec!["card".to_string()]);

        Ok(SetupIntent::create(&self.client, params).await?)
    }

    /// List the saved cards on a customer.
    pub async fn list_cards(&self, customer_id: &str) -> Result<Vec<CardSummary>, ApiError> {
        let customer = parse_customer_id(customer_id)?;

        let mut params = ListPaymentMethods::new();
        params.customer = Some(customer);
        params.type_ = Some(PaymentMethodTypeFilter::Card);

        let methods = PaymentMethod::list(&self.client, &params).await?;
        let cards = methods
            .data
            .into_iter()
            .filter_map(|pm| {
                let card = pm.card?;
                Some(CardSummary {
                    id: pm.id.to_string(),
                    brand: card.brand,
                    last4: card.last4,
                    exp_month: card.exp_month,
                    exp_year: card.exp_year,
                })
            })
            .collect();
        Ok(cards)
    }
}

fn parse_customer_id(customer_id: &str) -> Result<CustomerId, ApiError> {
    customer_id
        .parse()
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("Malformed Stripe customer id: {customer_id}")))
}
